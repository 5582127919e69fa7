use crossbeam_channel::{Sender, TryRecvError, unbounded};
use parking_lot::Mutex;
use rosc::{OscMessage, OscPacket, OscType};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::console::ControlCommand;
use crate::control::{CommandHandler, RemoteCommandSender};
use crate::midi_routing::{MidiReceiver, MidiTransmitter, RemoteSender};
use crate::midi_types::{MidiError, MidiSignal};

/// OSC address carrying MIDI signals between devices.
pub const MIDI_ADDRESS: &str = "/midi";
/// OSC address carrying control commands, one JSON string argument.
pub const COMMAND_ADDRESS: &str = "/command";

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid IP:Port formatting: {0}")]
    InvalidIpFormatting(String),
    #[error("Binding Error: {0}")]
    BindingError(String),
    #[error("Unknown remote device: {0}")]
    UnknownDevice(String),
    #[error("OSC encoding error: {0}")]
    Encoding(String),
    #[error("Send error: {0}")]
    Send(String),
}

/// A peer running the same engine, reachable over UDP.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDevice {
    pub name: String,
    /// `a.b.c.d:port`
    pub address: String,
}

pub fn parse_address(address: &str) -> Result<SocketAddr, Error> {
    use scan_fmt::scan_fmt;
    match scan_fmt!(address, "{}.{}.{}.{}:{}", u8, u8, u8, u8, u16) {
        Ok((a, b, c, d, port)) => Ok(SocketAddr::new(
            std::net::IpAddr::V4(Ipv4Addr::new(a, b, c, d)),
            port,
        )),
        _ => Err(Error::InvalidIpFormatting(address.to_string())),
    }
}

pub fn encode_signal(signal: &MidiSignal) -> Result<Vec<u8>, Error> {
    let packet = OscPacket::Message(OscMessage {
        addr: MIDI_ADDRESS.to_string(),
        args: vec![
            OscType::Int(signal.command as i32),
            OscType::Int(signal.channel as i32),
            OscType::Int(signal.note as i32),
            OscType::Int(signal.velocity as i32),
        ],
    });
    rosc::encoder::encode(&packet).map_err(|e| Error::Encoding(e.to_string()))
}

/// Extracts the MIDI signals of a packet, descending into bundles.
pub fn decode_signals(packet: &OscPacket) -> Vec<MidiSignal> {
    match packet {
        OscPacket::Message(message) if message.addr == MIDI_ADDRESS => {
            let ints: Vec<u8> = message
                .args
                .iter()
                .filter_map(|arg| match arg {
                    OscType::Int(x) if (0..=255).contains(x) => Some(*x as u8),
                    _ => None,
                })
                .collect();
            match ints.as_slice() {
                [command, channel, note, velocity] => {
                    vec![MidiSignal::new(*command, *channel, *note, *velocity)]
                }
                _ => {
                    tracing::warn!(?message, "Malformed remote MIDI message");
                    vec![]
                }
            }
        }
        OscPacket::Message(_) => vec![],
        OscPacket::Bundle(bundle) => bundle.content.iter().flat_map(decode_signals).collect(),
    }
}

pub fn encode_command(command: &ControlCommand) -> Result<Vec<u8>, Error> {
    let json = serde_json::to_string(command).map_err(|e| Error::Encoding(e.to_string()))?;
    let packet = OscPacket::Message(OscMessage {
        addr: COMMAND_ADDRESS.to_string(),
        args: vec![OscType::String(json)],
    });
    rosc::encoder::encode(&packet).map_err(|e| Error::Encoding(e.to_string()))
}

pub fn decode_commands(packet: &OscPacket) -> Vec<ControlCommand> {
    match packet {
        OscPacket::Message(message) if message.addr == COMMAND_ADDRESS => message
            .args
            .iter()
            .filter_map(|arg| match arg {
                OscType::String(json) => match serde_json::from_str(json) {
                    Ok(command) => Some(command),
                    Err(e) => {
                        tracing::warn!(error = %e, "Malformed remote command");
                        None
                    }
                },
                _ => None,
            })
            .collect(),
        OscPacket::Message(_) => vec![],
        OscPacket::Bundle(bundle) => bundle.content.iter().flat_map(decode_commands).collect(),
    }
}

/// Forwards signals to remote devices by name.
pub struct OscRemoteSender {
    socket: UdpSocket,
    devices: HashMap<String, SocketAddr>,
}

impl OscRemoteSender {
    pub fn new(devices: &[RemoteDevice]) -> Result<Self, Error> {
        let socket = UdpSocket::bind(SocketAddr::new(
            std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            0,
        ))
        .map_err(|e| Error::BindingError(e.to_string()))?;
        let mut addresses = HashMap::new();
        for device in devices {
            match parse_address(&device.address) {
                Ok(address) => {
                    addresses.insert(device.name.clone(), address);
                }
                Err(e) => tracing::warn!(device = device.name.as_str(), error = %e, "Skipping remote device"),
            }
        }
        Ok(Self {
            socket,
            devices: addresses,
        })
    }

    fn send_to(&self, device: &str, bytes: &[u8]) -> Result<(), Error> {
        let address = self
            .devices
            .get(device)
            .ok_or_else(|| Error::UnknownDevice(device.to_string()))?;
        self.socket
            .send_to(bytes, address)
            .map_err(|e| Error::Send(e.to_string()))?;
        Ok(())
    }
}

impl RemoteSender for OscRemoteSender {
    fn send(&self, device: &str, signal: &MidiSignal) -> Result<(), MidiError> {
        encode_signal(signal)
            .and_then(|bytes| self.send_to(device, &bytes))
            .map_err(|e| MidiError::Send(e.to_string()))
    }
}

impl RemoteCommandSender for OscRemoteSender {
    fn send_command(&self, device: &str, command: &ControlCommand) -> Result<(), MidiError> {
        encode_command(command)
            .and_then(|bytes| self.send_to(device, &bytes))
            .map_err(|e| MidiError::Send(e.to_string()))
    }
}

/// Receives MIDI and control commands from remote devices and hands them to
/// the current receiver and command handler.
pub struct OscMidiListener {
    thread_stopper: Sender<()>,
    thread_handle: JoinHandle<()>,
    receiver: Arc<Mutex<Option<Arc<dyn MidiReceiver>>>>,
    commands: Arc<Mutex<Option<Arc<dyn CommandHandler>>>>,
    local_addr: SocketAddr,
}

impl Drop for OscMidiListener {
    fn drop(&mut self) {
        if self.thread_stopper.send(()).is_err() {
            tracing::debug!("Remote MIDI listener already stopped");
        }
        self.thread_handle.abort();
    }
}

impl OscMidiListener {
    pub fn bind(address: &str, runtime: &tokio::runtime::Handle) -> Result<Self, Error> {
        let socket = UdpSocket::bind(parse_address(address)?)
            .map_err(|e| Error::BindingError(e.to_string()))?;
        let _ = socket.set_read_timeout(Some(Duration::from_millis(50)));
        let local_addr = socket
            .local_addr()
            .map_err(|e| Error::BindingError(e.to_string()))?;
        let (thread_stopper, thread_stop) = unbounded::<()>();
        let receiver: Arc<Mutex<Option<Arc<dyn MidiReceiver>>>> = Arc::new(Mutex::new(None));
        let target = Arc::clone(&receiver);
        let commands: Arc<Mutex<Option<Arc<dyn CommandHandler>>>> = Arc::new(Mutex::new(None));
        let handler = Arc::clone(&commands);

        let thread_handle = runtime.spawn_blocking(move || {
            let mut buffer = [0u8; rosc::decoder::MTU];
            loop {
                match thread_stop.try_recv() {
                    Ok(()) | Err(TryRecvError::Disconnected) => break,
                    Err(TryRecvError::Empty) => {}
                }
                let Ok((size, from)) = socket.recv_from(&mut buffer) else {
                    continue;
                };
                let Ok((_, packet)) = rosc::decoder::decode_udp(&buffer[..size]) else {
                    tracing::debug!(%from, "Ignoring undecodable OSC packet");
                    continue;
                };
                let current = target.lock().clone();
                if let Some(current) = current {
                    for signal in decode_signals(&packet) {
                        current.send(&signal);
                    }
                }
                let handler = handler.lock().clone();
                if let Some(handler) = handler {
                    for command in decode_commands(&packet) {
                        tracing::debug!(%from, command = %command, "Remote control command");
                        handler.handle(&command);
                    }
                }
            }
            tracing::info!("Remote MIDI listener stopped");
        });

        tracing::info!(%local_addr, "Listening for remote MIDI");
        Ok(Self {
            thread_stopper,
            thread_handle,
            receiver,
            commands,
            local_addr,
        })
    }

    pub fn set_command_handler(&self, handler: Option<Arc<dyn CommandHandler>>) {
        *self.commands.lock() = handler;
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl MidiTransmitter for OscMidiListener {
    fn set_receiver(&self, receiver: Option<Arc<dyn MidiReceiver>>) {
        *self.receiver.lock() = receiver;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;

    struct Collect(crossbeam_channel::Sender<MidiSignal>);

    impl MidiReceiver for Collect {
        fn send(&self, signal: &MidiSignal) {
            let _ = self.0.send(*signal);
        }
    }

    #[test]
    fn addresses_parse_with_port() {
        assert_eq!(
            parse_address("192.168.1.20:9000").unwrap(),
            "192.168.1.20:9000".parse::<SocketAddr>().unwrap()
        );
        assert!(matches!(
            parse_address("stage-left"),
            Err(Error::InvalidIpFormatting(_))
        ));
    }

    #[test]
    fn signals_survive_osc_encoding() {
        let signal = MidiSignal::note_on(5, 64, 99);
        let bytes = encode_signal(&signal).unwrap();
        let (_, packet) = rosc::decoder::decode_udp(&bytes).unwrap();
        assert_eq!(decode_signals(&packet), vec![signal]);
    }

    struct CollectCommands(crossbeam_channel::Sender<ControlCommand>);

    impl CommandHandler for CollectCommands {
        fn handle(&self, command: &ControlCommand) {
            let _ = self.0.send(command.clone());
        }
    }

    #[test]
    fn listener_runs_remote_commands() {
        let scheduler = Scheduler::new().unwrap();
        let listener = OscMidiListener::bind("127.0.0.1:0", scheduler.handle()).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        listener.set_command_handler(Some(Arc::new(CollectCommands(tx))));

        let sender = OscRemoteSender::new(&[RemoteDevice {
            name: "stage".into(),
            address: listener.local_addr().to_string(),
        }])
        .unwrap();
        let command = ControlCommand::Select {
            name: "Encore".into(),
        };
        sender.send_command("stage", &command).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), command);
    }

    #[test]
    fn unknown_device_is_an_error() {
        let sender = OscRemoteSender::new(&[]).unwrap();
        assert!(RemoteSender::send(&sender, "nobody", &MidiSignal::note_on(0, 0, 0)).is_err());
    }

    #[test]
    fn listener_forwards_remote_signals() {
        let scheduler = Scheduler::new().unwrap();
        let listener = OscMidiListener::bind("127.0.0.1:0", scheduler.handle()).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        listener.set_receiver(Some(Arc::new(Collect(tx))));

        let sender = OscRemoteSender::new(&[RemoteDevice {
            name: "self".into(),
            address: listener.local_addr().to_string(),
        }])
        .unwrap();
        let signal = MidiSignal::note_on(1, 2, 3);
        RemoteSender::send(&sender, "self", &signal).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), signal);
    }
}
