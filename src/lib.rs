pub mod audio;
pub mod backend;
pub mod composition;
pub mod config;
pub mod console;
pub mod control;
pub mod designer;
pub mod director;
pub mod dmx_output;
pub mod dmx_types;
pub mod effect;
pub mod midi_device;
pub mod midi_routing;
pub mod midi_types;
pub mod notify;
pub mod player;
pub mod remote;
pub mod scheduler;
