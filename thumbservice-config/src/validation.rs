use crate::models::Configuration;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(
        &mut self,
        message: S,
        hint: H,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Advisory checks on an otherwise valid configuration.
pub fn collect_warnings(config: &Configuration) -> ConfigWarnings {
    let mut warnings = ConfigWarnings::default();

    if config.polling.interval < Duration::from_secs(1) {
        warnings.push(format!(
            "pollIntervalSeconds of {:.3} polls the server more than once \
             a second",
            config.polling.interval.as_secs_f64()
        ));
    }

    if config.connection.port.is_none() {
        warnings.push_with_hint(
            "No port configured; the p4 client falls back to P4PORT",
            "Set \"port\": \"host:port\" in the configuration file",
        );
    }

    warnings
}
