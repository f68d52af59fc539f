//! Configuration validation utilities.

use super::error::{ConfigError, ConfigResult};
use super::schema::{DeliveryConfig, LogOutput, LoggingConfig, RetryConfig, StreamConfig, SwitchyardConfig};

/// Validates the entire configuration.
pub fn validate_config(config: &SwitchyardConfig) -> ConfigResult<()> {
    validate_logging_config(&config.logging)?;
    validate_stream_config(&config.streams)?;
    validate_delivery_config(&config.delivery)?;
    Ok(())
}

fn validate_logging_config(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::validation(
            "logging.file_path",
            "file output requires a file path",
        ));
    }
    Ok(())
}

fn validate_stream_config(streams: &StreamConfig) -> ConfigResult<()> {
    if streams.high_water_mark == 0 {
        return Err(ConfigError::validation(
            "streams.high_water_mark",
            "must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_delivery_config(delivery: &DeliveryConfig) -> ConfigResult<()> {
    validate_retry_config(&delivery.retry)?;

    if delivery.deduplication_window_ms == 0 {
        return Err(ConfigError::validation(
            "delivery.deduplication_window_ms",
            "must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_retry_config(retry: &RetryConfig) -> ConfigResult<()> {
    if retry.max_attempts == 0 {
        return Err(ConfigError::validation(
            "delivery.retry.max_attempts",
            "at least one attempt is required",
        ));
    }

    if retry.initial_delay_ms == 0 {
        return Err(ConfigError::validation(
            "delivery.retry.initial_delay_ms",
            "must be greater than 0",
        ));
    }

    if retry.max_delay_ms < retry.initial_delay_ms {
        return Err(ConfigError::validation(
            "delivery.retry.max_delay_ms",
            "must be greater than or equal to the initial delay",
        ));
    }

    if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
        return Err(ConfigError::validation(
            "delivery.retry.backoff_multiplier",
            "must be a finite number of at least 1.0",
        ));
    }

    Ok(())
}
