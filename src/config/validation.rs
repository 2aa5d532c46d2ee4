use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_stream_config(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_stream_config(config: &AppConfig) -> Result<(), ConfigError> {
    let stream = &config.stream;
    if stream.message_id_prefix.is_empty() {
        return Err(validation_err("stream.message_id_prefix cannot be empty"));
    }
    if stream.message_id_prefix.chars().any(char::is_whitespace) {
        return Err(validation_err(
            "stream.message_id_prefix cannot contain whitespace",
        ));
    }
    if let Some(idle_timeout_secs) = stream.idle_timeout_secs {
        if idle_timeout_secs == 0 {
            return Err(validation_err(
                "stream.idle_timeout_secs must be greater than 0 when set",
            ));
        }
    }
    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.features.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {valid_levels:?}"
        )));
    }
    Ok(())
}
