use std::fmt;
use std::time::Duration;

/// ISO8601 `PTnHnMnS` durations, the representation WSMan uses for
/// OperationTimeout and IdleTimeOut.
///
/// Only the time components are supported; WSMan timeouts never carry
/// year/month/day parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iso8601Duration(pub Duration);

impl Iso8601Duration {
    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn as_duration(self) -> Duration {
        self.0
    }

    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.strip_prefix("PT").or_else(|| value.strip_prefix("pt"))?;
        if rest.is_empty() {
            return None;
        }

        let mut total = 0f64;
        let mut number = String::new();
        for c in rest.chars() {
            match c {
                '0'..='9' | '.' => number.push(c),
                'H' | 'h' => {
                    total += number.parse::<f64>().ok()? * 3600.0;
                    number.clear();
                }
                'M' | 'm' => {
                    total += number.parse::<f64>().ok()? * 60.0;
                    number.clear();
                }
                'S' | 's' => {
                    total += number.parse::<f64>().ok()?;
                    number.clear();
                }
                _ => return None,
            }
        }
        if !number.is_empty() {
            return None; // trailing digits without a unit
        }

        Some(Self(Duration::from_secs_f64(total)))
    }
}

impl fmt::Display for Iso8601Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.0.as_secs();
        let hours = total / 3600;
        let minutes = (total % 3600) / 60;
        let seconds = total % 60;

        write!(f, "PT")?;
        if hours > 0 {
            write!(f, "{hours}H")?;
        }
        if minutes > 0 {
            write!(f, "{minutes}M")?;
        }
        if seconds > 0 || (hours == 0 && minutes == 0) {
            write!(f, "{seconds}S")?;
        }
        Ok(())
    }
}

impl From<Duration> for Iso8601Duration {
    fn from(value: Duration) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_seconds_only() {
        assert_eq!(Iso8601Duration::from_secs(60).to_string(), "PT1M");
        assert_eq!(Iso8601Duration::from_secs(90).to_string(), "PT1M30S");
        assert_eq!(Iso8601Duration::from_secs(7200).to_string(), "PT2H");
        assert_eq!(Iso8601Duration::from_secs(0).to_string(), "PT0S");
    }

    #[test]
    fn parses_the_usual_forms() {
        assert_eq!(
            Iso8601Duration::parse("PT60S"),
            Some(Iso8601Duration::from_secs(60))
        );
        assert_eq!(
            Iso8601Duration::parse("PT1M30S"),
            Some(Iso8601Duration::from_secs(90))
        );
        assert_eq!(
            Iso8601Duration::parse("PT2H"),
            Some(Iso8601Duration::from_secs(7200))
        );
    }

    #[test]
    fn round_trips() {
        for secs in [1, 59, 60, 61, 3600, 7323] {
            let rendered = Iso8601Duration::from_secs(secs).to_string();
            assert_eq!(
                Iso8601Duration::parse(&rendered),
                Some(Iso8601Duration::from_secs(secs)),
                "round trip of {secs}s via {rendered}"
            );
        }
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(Iso8601Duration::parse("60S"), None);
        assert_eq!(Iso8601Duration::parse("PT"), None);
        assert_eq!(Iso8601Duration::parse("PT5"), None);
        assert_eq!(Iso8601Duration::parse("P1DT5S"), None);
    }
}
