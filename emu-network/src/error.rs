use thiserror::Error;

/// Setup-phase failures of the harness
///
/// Every variant is fatal: it is surfaced before the run starts and propagated to the process
/// boundary. Overlapping subnets are not detected at all, and events scheduled after the stop
/// time are silently never dispatched, so neither has a variant here.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("invalid topology specification: {reason}")]
    InvalidTopologySpec { reason: String },
    #[error("host interface `{interface}` is unavailable: {reason}")]
    InterfaceUnavailable { interface: String, reason: String },
    #[error("invalid flow monitor configuration: {reason}")]
    InvalidFlowMonitorConfig { reason: String },
    #[error("cannot {operation} while the run is {state}")]
    InvalidRunState {
        operation: &'static str,
        state: &'static str,
    },
}

impl HarnessError {
    pub(crate) fn invalid_spec(reason: impl Into<String>) -> Self {
        HarnessError::InvalidTopologySpec {
            reason: reason.into(),
        }
    }

    pub(crate) fn interface_unavailable(interface: &str, reason: impl ToString) -> Self {
        HarnessError::InterfaceUnavailable {
            interface: interface.to_string(),
            reason: reason.to_string(),
        }
    }
}
