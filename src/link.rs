//! Device link: a TCP control channel the device drives and a UDP data
//! channel the host streams setpoints over, paced stop-and-wait by the
//! device's REQUEST_DATA bytes.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info, warn};
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::LinkError;
use crate::types::{MotorCommand, NUM_CHANNELS};

/// Single-byte opcodes shared with the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Stop = 0,
    Start = 1,
    Home = 2,
    Ready = 3,
    RequestData = 4,
    CurrentValues = 5,
    ServoOff = 6,
    ServoOn = 7,
    Defaults = 8,
    Restart = 9,
}

impl Command {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => Command::Stop,
            1 => Command::Start,
            2 => Command::Home,
            3 => Command::Ready,
            4 => Command::RequestData,
            5 => Command::CurrentValues,
            6 => Command::ServoOff,
            7 => Command::ServoOn,
            8 => Command::Defaults,
            9 => Command::Restart,
            _ => return None,
        })
    }
}

/// Device-originated events, delivered over a channel instead of a
/// callback so the consumer decides where to handle them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// All actuators homed and holding
    Ready,
    /// The device halted (explicit restart or control-channel reset)
    Restart,
}

/// The seam between the planners and the transport. The UDP transport
/// accepts chunk loss; a reliable variant can be slotted in here
/// without touching the planning side.
pub trait TrajectorySink {
    /// Queue an encoded trajectory for paced transmission.
    fn enqueue(&self, command: &MotorCommand) -> Result<(), LinkError>;
    /// Push the homing defaults and ask the device to home.
    fn home(&self, defaults: &[u16; NUM_CHANNELS]) -> Result<(), LinkError>;
    /// Read back the device's actual actuator ticks.
    fn current_values(&self) -> Result<[u16; NUM_CHANNELS], LinkError>;
    /// Halt the device and stop the background task.
    fn terminate(&mut self) -> Result<(), LinkError>;
}

const CONTROL_TIMEOUT: Duration = Duration::from_millis(250);
const REPLY_TIMEOUT: Duration = Duration::from_secs(1);
const LOOP_PAUSE: Duration = Duration::from_millis(5);
const QUEUE_DEPTH: usize = 64;

/// The UDP/TCP link to the motor-control firmware.
pub struct DeviceLink {
    data: UdpSocket,
    device_addr: SocketAddr,
    chunk_tx: Sender<Vec<u8>>,
    events_rx: Receiver<DeviceEvent>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    chunk_frames: usize,
}

impl DeviceLink {
    /// Accept the device's control connection on `listener` and start
    /// the background pacing task. Blocks until the device connects.
    pub fn connect(
        listener: TcpListener,
        device_addr: SocketAddr,
        chunk_frames: usize,
    ) -> Result<Self, LinkError> {
        info!(
            "waiting for device control connection on {}",
            listener.local_addr()?
        );
        let (control, peer) = listener.accept()?;
        info!("device connected from {}", peer);
        control.set_read_timeout(Some(CONTROL_TIMEOUT))?;

        let data = UdpSocket::bind(("0.0.0.0", 0))?;
        data.set_read_timeout(Some(REPLY_TIMEOUT))?;

        let (chunk_tx, chunk_rx) = bounded::<Vec<u8>>(QUEUE_DEPTH);
        let (events_tx, events_rx) = bounded::<DeviceEvent>(16);
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker_data = data.try_clone()?;
        let worker_stop = Arc::clone(&shutdown);
        let worker = thread::Builder::new()
            .name("device-link".into())
            .spawn(move || {
                pacing_loop(control, worker_data, device_addr, chunk_rx, events_tx, worker_stop)
            })?;

        Ok(Self {
            data,
            device_addr,
            chunk_tx,
            events_rx,
            shutdown,
            worker: Some(worker),
            chunk_frames,
        })
    }

    /// Bind the standard control port and wait for the device.
    pub fn bind(port: u16, device_addr: SocketAddr, chunk_frames: usize) -> Result<Self, LinkError> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        Self::connect(listener, device_addr, chunk_frames)
    }

    /// Stream of device-originated events.
    pub fn events(&self) -> &Receiver<DeviceEvent> {
        &self.events_rx
    }

    fn send_command(&self, cmd: Command) -> Result<(), LinkError> {
        self.data.send_to(&[cmd as u8], self.device_addr)?;
        Ok(())
    }
}

impl TrajectorySink for DeviceLink {
    fn enqueue(&self, command: &MotorCommand) -> Result<(), LinkError> {
        let chunks = command.chunk_bytes(self.chunk_frames);
        debug!(
            "queueing {} frames as {} chunk(s)",
            command.len(),
            chunks.len()
        );
        for chunk in chunks {
            self.chunk_tx
                .send(chunk)
                .map_err(|_| LinkError::NotConnected)?;
        }
        Ok(())
    }

    fn home(&self, defaults: &[u16; NUM_CHANNELS]) -> Result<(), LinkError> {
        // DEFAULTS carries its payload in the same packet so the
        // firmware can treat it atomically
        let mut pkt = Vec::with_capacity(2 * (1 + NUM_CHANNELS));
        pkt.write_u16::<LittleEndian>(Command::Defaults as u16)?;
        for &v in defaults {
            pkt.write_u16::<LittleEndian>(v)?;
        }
        self.data.send_to(&pkt, self.device_addr)?;
        self.send_command(Command::Home)
    }

    fn current_values(&self) -> Result<[u16; NUM_CHANNELS], LinkError> {
        self.send_command(Command::CurrentValues)?;
        let mut buf = [0u8; 64];
        let (got, _) = self.data.recv_from(&mut buf)?;
        let expected = 2 * NUM_CHANNELS;
        if got < expected {
            return Err(LinkError::ShortReply { got, expected });
        }
        let mut rd = &buf[..expected];
        let mut out = [0u16; NUM_CHANNELS];
        for v in out.iter_mut() {
            *v = rd.read_u16::<LittleEndian>()?;
        }
        Ok(out)
    }

    fn terminate(&mut self) -> Result<(), LinkError> {
        self.send_command(Command::Restart)?;
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        Ok(())
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Background task: watch the control channel for commands, and while a
/// data request is pending push exactly one queued chunk per request.
fn pacing_loop(
    mut control: TcpStream,
    data: UdpSocket,
    device_addr: SocketAddr,
    chunk_rx: Receiver<Vec<u8>>,
    events_tx: Sender<DeviceEvent>,
    shutdown: Arc<AtomicBool>,
) {
    let mut pending = false;
    let mut buf = [0u8; 1];

    while !shutdown.load(Ordering::Relaxed) {
        match control.read(&mut buf) {
            Ok(0) => {
                // orderly close counts as the device halting
                warn!("control channel closed by device");
                let _ = events_tx.send(DeviceEvent::Restart);
                break;
            }
            Ok(_) => match Command::from_byte(buf[0]) {
                Some(Command::RequestData) => pending = true,
                Some(Command::Ready) => {
                    info!("device ready");
                    let _ = events_tx.send(DeviceEvent::Ready);
                }
                Some(Command::Restart) => {
                    warn!("device requested restart");
                    let _ = events_tx.send(DeviceEvent::Restart);
                }
                other => debug!("ignoring control byte {:?}", other),
            },
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => {
                // a reset means the device died mid-stream
                error!("control channel error: {}", e);
                let _ = events_tx.send(DeviceEvent::Restart);
                break;
            }
        }

        if pending {
            if let Ok(chunk) = chunk_rx.try_recv() {
                match data.send_to(&chunk, device_addr) {
                    Ok(_) => pending = false,
                    Err(e) => warn!("chunk send failed: {}", e),
                }
            }
        }

        // breathe between polls so the device is not flooded
        thread::sleep(LOOP_PAUSE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_byte_round_trip() {
        for b in 0u8..=9 {
            let cmd = Command::from_byte(b).unwrap();
            assert_eq!(cmd as u8, b);
        }
        assert!(Command::from_byte(10).is_none());
        assert_eq!(Command::RequestData as u8, 4);
        assert_eq!(Command::Defaults as u8, 8);
    }
}
