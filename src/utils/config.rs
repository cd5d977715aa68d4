//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`. Returns
/// an `Ok(config)` on success, and `Err(PalisadeError)` on parser failure or
/// unrecognized field names.
///
/// Example:
/// ```ignore
/// let config = parsed_config!(config_str => MyConfig; quorum_size, ttl_ms)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, PalisadeError> {
            let mut config: $config_type = Default::default();
            if config_str.is_none() {
                return Ok(config);
            }

            let mut table = config_str.unwrap().parse::<toml::Table>()?;

            // traverse through all given field names
            $({
                // if field name found in table (and removed)
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // if table is not empty at this time, some parsed keys are not
            // expected hence invalid
            if !table.is_empty() {
                return Err(PalisadeError(format!(
                    "invalid field name '{}' in config",
                    table.keys().next().unwrap(),
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod tests {
    use crate::utils::PalisadeError;

    #[derive(Debug, PartialEq)]
    struct TestConfig {
        spokes: u16,
        greeting: String,
        ratio: f64,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                spokes: 5,
                greeting: "hola".into(),
                ratio: 0.62,
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<(), PalisadeError> {
        let config = parsed_config!(None => TestConfig; spokes, greeting, ratio)?;
        let ref_config: TestConfig = Default::default();
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<(), PalisadeError> {
        let config_str = Some("greeting = 'ahoy'");
        let config = parsed_config!(config_str => TestConfig; greeting, ratio)?;
        let ref_config = TestConfig {
            spokes: 5,
            greeting: "ahoy".into(),
            ratio: 0.62,
        };
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let config_str = Some("color = 'purple'");
        assert!(parsed_config!(config_str => TestConfig; spokes).is_err());
    }
}
