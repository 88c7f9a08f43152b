//! Text commands for driving a [`DaqSession`] remotely.
//!
//! One command per line, replies are single-line JSON status objects. The
//! transport carrying the lines is up to the caller.

use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;

use crate::config::SessionConfig;
use crate::session::{DaqSession, SessionError};

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Empty command")]
    Empty,

    #[error("Unknown command '{0}'")]
    Unknown(String),

    #[error("Command '{0}' requires an argument")]
    MissingArgument(&'static str),

    #[error("Invalid frequency '{0}'")]
    InvalidFrequency(String),

    #[error("{0}")]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCommand {
    StartRecording(PathBuf),
    StartViewing,
    Stop,
    Status,
    Pulse(f64),
    PulseStop,
}

impl FromStr for RemoteCommand {
    type Err = ControlError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (name, argument) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, Some(rest.trim()).filter(|a| !a.is_empty())),
            None => (line, None),
        };

        match name {
            "" => Err(ControlError::Empty),
            "start_recording" => argument
                .map(|path| Self::StartRecording(PathBuf::from(path)))
                .ok_or(ControlError::MissingArgument("start_recording")),
            "start_viewing" => Ok(Self::StartViewing),
            "stop" => Ok(Self::Stop),
            "status" => Ok(Self::Status),
            "pulse" => {
                let argument = argument.ok_or(ControlError::MissingArgument("pulse"))?;
                match argument.parse::<f64>() {
                    Ok(frequency) if frequency > 0.0 && frequency.is_finite() => Ok(Self::Pulse(frequency)),
                    _ => Err(ControlError::InvalidFrequency(argument.to_string())),
                }
            }
            "pulse_stop" => Ok(Self::PulseStop),
            other => Err(ControlError::Unknown(other.to_string())),
        }
    }
}

/// Reply sent back for every command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReply {
    pub ok: bool,
    pub state: String,
    pub is_recording: bool,
    pub is_viewing: bool,
    pub is_pulsing: bool,
    pub device: Option<String>,
    pub file_name: Option<String>,
    pub samples: u64,
    pub error: Option<String>,
}

impl StatusReply {
    pub fn from_session(session: &DaqSession) -> Self {
        Self {
            ok: true,
            state: session.state().to_string(),
            is_recording: session.is_recording(),
            is_viewing: session.is_viewing(),
            is_pulsing: session.is_pulsing(),
            device: session.descriptor().map(ToString::to_string),
            file_name: session.file_name().map(|p| p.display().to_string()),
            samples: session.stats().samples,
            error: None,
        }
    }

    fn failed(mut self, err: &ControlError) -> Self {
        self.ok = false;
        self.error = Some(err.to_string());
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| {
            log::error!("Failed to encode status reply: {err}");
            r#"{"ok":false}"#.to_string()
        })
    }
}

/// Routes remote commands to a session, starting acquisitions with a fixed
/// configuration.
pub struct RemoteController {
    config: SessionConfig,
}

impl RemoteController {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: SessionConfig) {
        self.config = config;
    }

    pub fn execute(&self, session: &mut DaqSession, command: &RemoteCommand) -> Result<(), ControlError> {
        log::debug!("Remote command: {command:?}");
        match command {
            RemoteCommand::StartRecording(path) => {
                session.start_recording(self.config.clone(), path)?;
            }
            RemoteCommand::StartViewing => session.start_viewing(self.config.clone())?,
            RemoteCommand::Stop => session.stop()?,
            RemoteCommand::Status => {}
            RemoteCommand::Pulse(frequency) => {
                session.start_pulsing(*frequency)?;
            }
            RemoteCommand::PulseStop => session.stop_pulsing()?,
        }
        Ok(())
    }

    /// Parse and run one command line, returning the JSON reply.
    pub fn handle_line(&self, session: &mut DaqSession, line: &str) -> String {
        let result = line
            .parse::<RemoteCommand>()
            .and_then(|command| self.execute(session, &command));

        let reply = StatusReply::from_session(session);
        match result {
            Ok(()) => reply.to_json(),
            Err(err) => {
                log::warn!("Remote command '{}' failed: {err}", line.trim());
                reply.failed(&err).to_json()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{SimulatedDevice, SimulatedDriver};
    use std::sync::Arc;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            "start_recording /tmp/run 1.bin".parse::<RemoteCommand>().unwrap(),
            RemoteCommand::StartRecording(PathBuf::from("/tmp/run 1.bin"))
        );
        assert_eq!("  stop\n".parse::<RemoteCommand>().unwrap(), RemoteCommand::Stop);
        assert_eq!("pulse 40".parse::<RemoteCommand>().unwrap(), RemoteCommand::Pulse(40.0));
        assert_eq!("pulse_stop".parse::<RemoteCommand>().unwrap(), RemoteCommand::PulseStop);

        assert!(matches!("".parse::<RemoteCommand>(), Err(ControlError::Empty)));
        assert!(matches!(
            "start_recording".parse::<RemoteCommand>(),
            Err(ControlError::MissingArgument("start_recording"))
        ));
        assert!(matches!(
            "pulse -3".parse::<RemoteCommand>(),
            Err(ControlError::InvalidFrequency(_))
        ));
        assert!(matches!(
            "launch".parse::<RemoteCommand>(),
            Err(ControlError::Unknown(ref name)) if name == "launch"
        ));
    }

    #[test]
    fn test_handle_line_replies_with_status() {
        let device = Arc::new(SimulatedDevice::builder().build());
        let mut session = DaqSession::new(Box::new(SimulatedDriver::new(vec![device])));
        let controller = RemoteController::new(SessionConfig::builder().channel_range(0, 1).build().unwrap());

        let reply: serde_json::Value =
            serde_json::from_str(&controller.handle_line(&mut session, "start_viewing")).unwrap();
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["state"], "idle");

        session.scan_devices().unwrap();
        session.connect(0).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote.bin");
        let reply: serde_json::Value = serde_json::from_str(
            &controller.handle_line(&mut session, &format!("start_recording {}", path.display())),
        )
        .unwrap();
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["is_recording"], true);
        assert_eq!(reply["device"], "USB-1608G_SIM0001");

        let reply: serde_json::Value =
            serde_json::from_str(&controller.handle_line(&mut session, "pulse 10")).unwrap();
        assert_eq!(reply["is_pulsing"], true);

        let reply: serde_json::Value =
            serde_json::from_str(&controller.handle_line(&mut session, "stop")).unwrap();
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["state"], "connected");
        assert_eq!(reply["is_pulsing"], true);
        assert_eq!(reply["file_name"], path.display().to_string());
    }

    #[test]
    fn test_set_config_applies_to_next_start() {
        let device = Arc::new(SimulatedDevice::builder().build());
        let mut session = DaqSession::new(Box::new(SimulatedDriver::new(vec![device])));
        session.scan_devices().unwrap();
        session.connect(0).unwrap();

        let mut controller = RemoteController::new(SessionConfig::builder().channel_range(0, 1).build().unwrap());
        controller.set_config(SessionConfig::builder().channel_range(2, 5).build().unwrap());
        assert_eq!(controller.config().num_channels(), 4);

        let reply: serde_json::Value =
            serde_json::from_str(&controller.handle_line(&mut session, "start_viewing")).unwrap();
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["is_viewing"], true);
        assert_eq!(session.data_queues().map(crate::DisplayQueues::len), Some(4));
        controller.handle_line(&mut session, "stop");
    }
}
