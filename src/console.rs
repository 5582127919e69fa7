use std::sync::Arc;

use crate::designer::LightingDesignEngine;
use crate::director::Director;
use crate::player::PlayerError;
use scan_fmt::scan_fmt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsoleError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Invalid level: {0}. Must be between 0 and 100")]
    InvalidLevel(String),
    #[error("Missing arguments for command: {0}")]
    MissingArgs(String),
    #[error("No lighting engine running")]
    NoLighting,
    #[error(transparent)]
    Player(#[from] PlayerError),
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, strum::Display)]
pub enum ControlCommand {
    #[strum(serialize = "Play")]
    Play,
    #[strum(serialize = "Pause")]
    Pause,
    #[strum(serialize = "Stop")]
    Stop,
    #[strum(serialize = "Toggle")]
    Toggle,
    #[strum(serialize = "Seek {millis}")]
    Seek { millis: u64 },
    #[strum(serialize = "Next")]
    Next,
    #[strum(serialize = "Previous")]
    Previous,
    #[strum(serialize = "Select {name}")]
    Select { name: String },
    #[strum(serialize = "Start {name}")]
    SelectAndPlay { name: String },
    #[strum(serialize = "Sample {name}")]
    Sample { name: String },
    #[strum(serialize = "Setlist {name}")]
    SetList { name: String },
    #[strum(serialize = "Default")]
    PlayDefault,
    #[strum(serialize = "Dimmer {percent}")]
    Dimmer { percent: u8 },
    #[strum(serialize = "Blackout")]
    Blackout,
    #[strum(serialize = "Preview preset {uuid}")]
    PreviewPreset { uuid: String },
    #[strum(serialize = "Preview scenes")]
    PreviewScenes { uuids: Vec<String> },
    #[strum(serialize = "Preview off")]
    PreviewOff,
    #[strum(serialize = "Status")]
    Status,
}

/// Splits off the first word, lowercased, keeping the rest as typed.
fn keyword(input: &str) -> (String, &str) {
    let input = input.trim();
    match input.split_once(char::is_whitespace) {
        Some((word, rest)) => (word.to_lowercase(), rest.trim()),
        None => (input.to_lowercase(), ""),
    }
}

fn named(command: &str, rest: &str) -> Result<String, ConsoleError> {
    if rest.is_empty() {
        Err(ConsoleError::MissingArgs(command.to_string()))
    } else {
        Ok(rest.to_string())
    }
}

impl TryFrom<String> for ControlCommand {
    type Error = ConsoleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let s = value.trim().to_lowercase();
        if matches!(s.as_str(), "b/o" | "bo" | "blackout") {
            return Ok(ControlCommand::Blackout);
        }
        if let Ok(millis) = scan_fmt!(&s, "seek {}", u64) {
            return Ok(ControlCommand::Seek { millis });
        }
        if let Ok(percent) = scan_fmt!(&s, "dimmer {}", u8) {
            if percent > 100 {
                return Err(ConsoleError::InvalidLevel(percent.to_string()));
            }
            return Ok(ControlCommand::Dimmer { percent });
        }

        let (word, rest) = keyword(&value);
        match word.as_str() {
            "play" | "go" => Ok(ControlCommand::Play),
            "pause" => Ok(ControlCommand::Pause),
            "stop" => Ok(ControlCommand::Stop),
            "toggle" => Ok(ControlCommand::Toggle),
            "next" => Ok(ControlCommand::Next),
            "prev" | "previous" => Ok(ControlCommand::Previous),
            "default" => Ok(ControlCommand::PlayDefault),
            "status" => Ok(ControlCommand::Status),
            "select" => Ok(ControlCommand::Select {
                name: named(&word, rest)?,
            }),
            "start" => Ok(ControlCommand::SelectAndPlay {
                name: named(&word, rest)?,
            }),
            "sample" => Ok(ControlCommand::Sample {
                name: named(&word, rest)?,
            }),
            "setlist" => Ok(ControlCommand::SetList {
                name: named(&word, rest)?,
            }),
            "preview" => {
                let (target, args) = keyword(rest);
                match target.as_str() {
                    "off" => Ok(ControlCommand::PreviewOff),
                    "preset" => Ok(ControlCommand::PreviewPreset {
                        uuid: named("preview preset", args)?,
                    }),
                    "scene" | "scenes" if !args.is_empty() => Ok(ControlCommand::PreviewScenes {
                        uuids: args.split_whitespace().map(String::from).collect(),
                    }),
                    _ => Err(ConsoleError::MissingArgs(word)),
                }
            }
            "seek" | "dimmer" if rest.is_empty() => Err(ConsoleError::MissingArgs(word)),
            "dimmer" => Err(ConsoleError::InvalidLevel(rest.to_string())),
            _ => Err(ConsoleError::UnknownCommand(value)),
        }
    }
}

impl ControlCommand {
    pub fn parse(input: &str) -> Result<ControlCommand, ConsoleError> {
        ControlCommand::try_from(input.to_string())
    }
}

/// Line-oriented control surface over the director.
pub struct Console {
    director: Arc<Director>,
    designer: Option<Arc<LightingDesignEngine>>,
    master_dimmer: f64,
    pub command_history: Vec<ControlCommand>,
}

impl Console {
    pub fn new(
        director: Arc<Director>,
        designer: Option<Arc<LightingDesignEngine>>,
        master_dimmer: f64,
    ) -> Self {
        Self {
            director,
            designer,
            master_dimmer,
            command_history: Vec::new(),
        }
    }

    /// Parses and runs one line, returning a short status for the operator.
    pub fn execute_line(&mut self, line: &str) -> Result<String, ConsoleError> {
        let command = ControlCommand::parse(line)?;
        let reply = self.execute(&command)?;
        self.command_history.push(command);
        Ok(reply)
    }

    pub fn execute(&mut self, command: &ControlCommand) -> Result<String, ConsoleError> {
        let director = Arc::clone(&self.director);
        match command {
            ControlCommand::Play => director.play()?,
            ControlCommand::Pause => director.pause()?,
            ControlCommand::Stop => director.stop()?,
            ControlCommand::Toggle => director.toggle_play()?,
            ControlCommand::Seek { millis } => director.seek(*millis)?,
            ControlCommand::Next => {
                if !director.next_composition()? {
                    return Ok("Already at the last composition".into());
                }
            }
            ControlCommand::Previous => {
                if !director.previous_composition()? {
                    return Ok("Already at the first composition".into());
                }
            }
            ControlCommand::Select { name } => director.set_composition(name)?,
            ControlCommand::SelectAndPlay { name } => {
                director.set_composition(name)?;
                director.play()?;
            }
            ControlCommand::Sample { name } => director.play_sample(name)?,
            ControlCommand::SetList { name } => director.load_set_list(name)?,
            ControlCommand::PlayDefault => director.play_default_composition()?,
            ControlCommand::Dimmer { percent } => {
                self.set_master_dimmer(*percent as f64 / 100.0)?;
            }
            ControlCommand::Blackout => {
                let level = if self.master_dimmer != 0.0 { 0.0 } else { 1.0 };
                self.set_master_dimmer(level)?;
            }
            ControlCommand::PreviewPreset { uuid } => {
                let designer = self.designer()?;
                designer.set_preview_preset(true);
                designer.set_selected_preset_uuid(Some(uuid.clone()));
                designer.start_preview();
            }
            ControlCommand::PreviewScenes { uuids } => {
                let designer = self.designer()?;
                designer.set_preview_preset(false);
                designer.set_selected_scene_uuids(uuids.clone());
                designer.start_preview();
            }
            ControlCommand::PreviewOff => self.designer()?.stop_preview(),
            ControlCommand::Status => {}
        }
        Ok(self.status())
    }

    fn designer(&self) -> Result<&Arc<LightingDesignEngine>, ConsoleError> {
        self.designer.as_ref().ok_or(ConsoleError::NoLighting)
    }

    fn set_master_dimmer(&mut self, level: f64) -> Result<(), ConsoleError> {
        self.designer()?.set_master_dimmer(level);
        self.master_dimmer = level;
        Ok(())
    }

    pub fn status(&self) -> String {
        let player = self.director.current_player();
        let composition = player
            .composition()
            .map(|c| c.name.clone())
            .unwrap_or_else(|| "-".into());
        format!(
            "{composition} {} at {} ms, dimmer {:.0}%",
            player.state(),
            player.position_millis(),
            self.master_dimmer * 100.0
        )
    }
}
