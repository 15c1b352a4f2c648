use base64::Engine;

/// Encode a script the way `powershell -EncodedCommand` expects it:
/// UTF-16LE bytes, base64'd.
///
/// Whenever a caller-supplied script has to be interpolated into a non-XML
/// carrier (direct-host command lines and the like), this is the only safe
/// embedding; string splicing invites injection.
pub fn encode_script_utf16le_base64(script: &str) -> String {
    let mut bytes = Vec::with_capacity(script.len() * 2);
    for unit in script.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_script_matches_known_encoding() {
        // "dir" → 64 00 69 00 72 00
        assert_eq!(encode_script_utf16le_base64("dir"), "ZABpAHIA");
    }

    #[test]
    fn non_ascii_scripts_survive() {
        let encoded = encode_script_utf16le_base64("Write-Output 'héllo — ✓'");
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .expect("valid base64");
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(
            String::from_utf16(&units).expect("valid UTF-16"),
            "Write-Output 'héllo — ✓'"
        );
    }

    #[test]
    fn quotes_and_semicolons_are_not_special() {
        let encoded = encode_script_utf16le_base64(r#"'; Remove-Item -Recurse / #"#);
        assert!(!encoded.contains(';'));
        assert!(!encoded.contains('\''));
    }
}
