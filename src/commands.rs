use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use tracing::{debug, error, info};

use crate::client::{DeviceApi, DeviceTypeCache};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Switch,
    Motion,
    Temperature,
    Humidity,
    Contact,
    Acceleration,
    Presence,
    Battery,
    ThreeAxis,
}

impl DeviceType {
    pub const ALL: [DeviceType; 9] = [
        DeviceType::Switch,
        DeviceType::Motion,
        DeviceType::Temperature,
        DeviceType::Humidity,
        DeviceType::Contact,
        DeviceType::Acceleration,
        DeviceType::Presence,
        DeviceType::Battery,
        DeviceType::ThreeAxis,
    ];

    /// Path segment used by the SmartApp.
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Switch => "switch",
            DeviceType::Motion => "motion",
            DeviceType::Temperature => "temperature",
            DeviceType::Humidity => "humidity",
            DeviceType::Contact => "contact",
            DeviceType::Acceleration => "acceleration",
            DeviceType::Presence => "presence",
            DeviceType::Battery => "battery",
            DeviceType::ThreeAxis => "threeAxis",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DeviceType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::UnknownDeviceType(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    Device(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set {
        device_type: DeviceType,
        device_name: String,
        command: String,
    },
    Query {
        device_type: DeviceType,
        target: Target,
    },
}

/// Greedy left-to-right parser over the raw tokens.
///
/// Each item is one command, or the error for one command whose tokens were
/// still consumed. A form with too few arguments swallows the rest of the
/// stream, since nothing after it can be realigned.
pub struct CommandStream<'a> {
    tokens: &'a [String],
    pos: usize,
}

impl<'a> CommandStream<'a> {
    pub fn new(tokens: &'a [String]) -> Self {
        Self { tokens, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.tokens.len() - self.pos
    }

    fn take_args(&mut self, keyword: &str, count: usize, usage: &str) -> Result<&'a [String]> {
        if self.remaining() < count {
            self.pos = self.tokens.len();
            return Err(Error::MalformedCommand {
                keyword: keyword.to_string(),
                reason: format!("expected `{keyword} {usage}`"),
            });
        }
        let tokens = self.tokens;
        let args = &tokens[self.pos..self.pos + count];
        self.pos += count;
        Ok(args)
    }
}

impl Iterator for CommandStream<'_> {
    type Item = Result<Command>;

    fn next(&mut self) -> Option<Self::Item> {
        let tokens = self.tokens;
        while self.pos < tokens.len() {
            let keyword = tokens[self.pos].as_str();
            self.pos += 1;

            match keyword {
                "set" => {
                    return Some(
                        self.take_args("set", 3, "DEVICE_TYPE DEVICE_NAME COMMAND")
                            .and_then(|args| {
                                Ok(Command::Set {
                                    device_type: args[0].parse()?,
                                    device_name: args[1].clone(),
                                    command: args[2].clone(),
                                })
                            }),
                    );
                }
                "query" => {
                    return Some(
                        self.take_args("query", 2, "DEVICE_TYPE (DEVICE_NAME | all)")
                            .and_then(|args| {
                                let target = match args[1].as_str() {
                                    "all" => Target::All,
                                    name => Target::Device(name.to_string()),
                                };
                                Ok(Command::Query {
                                    device_type: args[0].parse()?,
                                    target,
                                })
                            }),
                    );
                }
                other => debug!("Skipping unrecognized token: {other}"),
            }
        }
        None
    }
}

pub fn parse(tokens: &[String]) -> Vec<Result<Command>> {
    CommandStream::new(tokens).collect()
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// A queried device reported a non-empty state.
    pub alert: bool,
    /// Device states logged by queries.
    pub reported: usize,
    /// Commands skipped because they were malformed or named an unknown type/device.
    pub failed: usize,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        i32::from(self.alert)
    }
}

/// Runs parsed commands, fetching each device type's status at most once.
pub struct Dispatcher<'a, A> {
    api: &'a A,
    caches: HashMap<DeviceType, DeviceTypeCache>,
}

impl<'a, A: DeviceApi> Dispatcher<'a, A> {
    pub fn new(api: &'a A) -> Self {
        Self {
            api,
            caches: HashMap::new(),
        }
    }

    /// Execute every item in order. Unknown types or devices and malformed
    /// commands are logged and skipped; platform failures end the run.
    pub async fn run(&mut self, items: Vec<Result<Command>>) -> Result<RunOutcome> {
        let mut outcome = RunOutcome::default();

        for item in items {
            let result = match item {
                Ok(command) => self.execute(&command, &mut outcome).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {}
                Err(
                    e @ (Error::UnknownDeviceType(_)
                    | Error::UnknownDevice { .. }
                    | Error::MalformedCommand { .. }),
                ) => {
                    error!("{e}");
                    outcome.failed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(outcome)
    }

    async fn execute(&mut self, command: &Command, outcome: &mut RunOutcome) -> Result<()> {
        match command {
            Command::Set {
                device_type,
                device_name,
                command,
            } => self.set(*device_type, device_name, command).await,
            Command::Query {
                device_type,
                target,
            } => self.query(*device_type, target, outcome).await,
        }
    }

    async fn devices(&mut self, device_type: DeviceType) -> Result<&DeviceTypeCache> {
        if !self.caches.contains_key(&device_type) {
            let cache = self.api.get_status(device_type).await?;
            debug!("Cached {} {device_type} device(s)", cache.len());
            self.caches.insert(device_type, cache);
        }
        Ok(&self.caches[&device_type])
    }

    async fn set(&mut self, device_type: DeviceType, device_name: &str, command: &str) -> Result<()> {
        let device_id = self
            .devices(device_type)
            .await?
            .get(device_name)
            .map(|record| record.device_id.clone())
            .ok_or_else(|| Error::UnknownDevice {
                device_type: device_type.to_string(),
                name: device_name.to_string(),
            })?;

        info!("Issuing \"{command}\" command to {device_type} \"{device_name}\"");
        self.api
            .send_command(device_type, &device_id, command)
            .await?;
        Ok(())
    }

    async fn query(
        &mut self,
        device_type: DeviceType,
        target: &Target,
        outcome: &mut RunOutcome,
    ) -> Result<()> {
        let devices = self.devices(device_type).await?;

        let selected: Vec<_> = match target {
            Target::All => devices.iter().collect(),
            Target::Device(name) => {
                let record = devices.get_key_value(name).ok_or_else(|| Error::UnknownDevice {
                    device_type: device_type.to_string(),
                    name: name.clone(),
                })?;
                vec![record]
            }
        };

        for (name, record) in selected {
            info!(
                "{device_type} {name}: {}",
                record.state.as_deref().unwrap_or_default()
            );
            outcome.reported += 1;
            if record.is_alerting() {
                outcome.alert = true;
            }
        }
        Ok(())
    }
}
