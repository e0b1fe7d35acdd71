//! Error types for the simulation engine.
//!
//! Every fatal condition in the engine is reported as a [`SimError`]. The
//! constructors are `#[track_caller]`, so each error remembers the file and
//! line of the call that detected the violation.

use std::panic::Location;
use thiserror::Error;

/// Result type used throughout the engine.
pub type SimResult<T> = Result<T, SimError>;

/// Call-site of the violating operation.
pub type ErrorLocation = &'static Location<'static>;

/// Errors that can occur while building or running a simulation.
#[derive(Error, Debug)]
pub enum SimError {
    /// Unknown component type, duplicate id, unconnected port, bad parameter.
    #[error("configuration error at {location}: {message}")]
    Configuration {
        message: String,
        location: ErrorLocation,
    },

    /// Insert in the past, zero effective latency, zero clock period, overflow.
    #[error("temporal error at {location}: {message}")]
    Temporal {
        message: String,
        location: ErrorLocation,
    },

    /// Unknown event type tag, truncated buffer, oversize event.
    #[error("serialization error at {location}: {message}")]
    Serialization {
        message: String,
        location: ErrorLocation,
    },

    /// Exhausted or disconnected sync pipeline, failed rank transport.
    #[error("resource error at {location}: {message}")]
    Resource {
        message: String,
        location: ErrorLocation,
    },

    /// Write through an unregistered field handle, misuse of an output.
    #[error("statistic error at {location}: {message}")]
    Statistic {
        message: String,
        location: ErrorLocation,
    },

    /// Missing or unparsable parameter.
    #[error("parameter error at {location}: {message}")]
    Params {
        message: String,
        location: ErrorLocation,
    },

    /// Invalid time or frequency string.
    #[error("time format error at {location}: {message}")]
    Time {
        message: String,
        location: ErrorLocation,
    },

    /// Fatal condition raised by a component through its `Output`.
    #[error("fatal at {location}: {message}")]
    Fatal {
        message: String,
        location: ErrorLocation,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

macro_rules! located_ctor {
    ($(#[$doc:meta])* $name:ident => $variant:ident) => {
        $(#[$doc])*
        #[track_caller]
        pub fn $name(message: impl Into<String>) -> Self {
            SimError::$variant {
                message: message.into(),
                location: Location::caller(),
            }
        }
    };
}

impl SimError {
    located_ctor!(
        /// Creates a configuration error.
        configuration => Configuration
    );
    located_ctor!(
        /// Creates a temporal error.
        temporal => Temporal
    );
    located_ctor!(
        /// Creates a serialization error.
        serialization => Serialization
    );
    located_ctor!(
        /// Creates a resource error.
        resource => Resource
    );
    located_ctor!(
        /// Creates a statistic error.
        statistic => Statistic
    );
    located_ctor!(
        /// Creates a parameter error.
        params => Params
    );
    located_ctor!(
        /// Creates a time format error.
        time => Time
    );
    located_ctor!(
        /// Creates a generic fatal error.
        fatal => Fatal
    );

    /// Short name of the error class.
    pub fn category(&self) -> &'static str {
        match self {
            SimError::Configuration { .. } => "configuration",
            SimError::Temporal { .. } => "temporal",
            SimError::Serialization { .. } => "serialization",
            SimError::Resource { .. } => "resource",
            SimError::Statistic { .. } => "statistic",
            SimError::Params { .. } => "params",
            SimError::Time { .. } => "time",
            SimError::Fatal { .. } => "fatal",
            SimError::Io(_) => "io",
            SimError::Yaml(_) | SimError::Json(_) => "config-format",
        }
    }

    /// Location of the call that raised the error, when known.
    pub fn location(&self) -> Option<ErrorLocation> {
        match self {
            SimError::Configuration { location, .. }
            | SimError::Temporal { location, .. }
            | SimError::Serialization { location, .. }
            | SimError::Resource { location, .. }
            | SimError::Statistic { location, .. }
            | SimError::Params { location, .. }
            | SimError::Time { location, .. }
            | SimError::Fatal { location, .. } => Some(location),
            _ => None,
        }
    }

    /// Process exit code for this error. Success is 0.
    pub fn exit_code(&self) -> i32 {
        match self {
            SimError::Fatal { .. } => 1,
            SimError::Configuration { .. }
            | SimError::Params { .. }
            | SimError::Time { .. }
            | SimError::Yaml(_)
            | SimError::Json(_) => 2,
            SimError::Temporal { .. } => 3,
            SimError::Serialization { .. } => 4,
            SimError::Resource { .. } | SimError::Io(_) => 5,
            SimError::Statistic { .. } => 6,
        }
    }

    /// Returns true for temporal errors.
    pub fn is_temporal(&self) -> bool {
        matches!(self, SimError::Temporal { .. })
    }

    /// Returns true for configuration errors.
    pub fn is_configuration(&self) -> bool {
        matches!(self, SimError::Configuration { .. })
    }

    /// Returns true for serialization errors.
    pub fn is_serialization(&self) -> bool {
        matches!(self, SimError::Serialization { .. })
    }
}

impl From<bincode::Error> for SimError {
    #[track_caller]
    fn from(err: bincode::Error) -> Self {
        SimError::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_records_location() {
        let err = SimError::temporal("insert at 5 before current time 10");
        let loc = err.location().unwrap();
        assert!(loc.file().ends_with("error.rs"));
        assert!(err.to_string().contains("error.rs"));
        assert!(err.to_string().contains("current time 10"));
        assert!(err.is_temporal());
    }

    #[test]
    fn test_exit_codes_are_nonzero() {
        let errors = vec![
            SimError::configuration("x"),
            SimError::temporal("x"),
            SimError::serialization("x"),
            SimError::resource("x"),
            SimError::statistic("x"),
            SimError::fatal("x"),
        ];
        for err in errors {
            assert_ne!(err.exit_code(), 0, "{}", err.category());
        }
    }
}
