//! A minimal in-process stand-in for the motor-control firmware, used
//! by the integration tests and, unless --hardware is given, by the
//! binary. Speaks
//! the real protocol over loopback: connects to the host's control
//! port, homes on request and paces the data stream with REQUEST_DATA.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::link::Command;
use crate::types::{MotorCommand, NUM_CHANNELS};

/// Everything the emulated device has observed, shared with the test
/// body.
#[derive(Debug, Default)]
pub struct SimState {
    pub frames: Vec<[u16; NUM_CHANNELS]>,
    pub defaults: Option<[u16; NUM_CHANNELS]>,
    pub homed: bool,
    pub restarted: bool,
}

impl SimState {
    /// Device-side notion of "where the motors are": the homing
    /// defaults until data arrives, then the last streamed frame.
    pub fn current(&self) -> [u16; NUM_CHANNELS] {
        self.frames
            .last()
            .copied()
            .or(self.defaults)
            .unwrap_or([0; NUM_CHANNELS])
    }
}

pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    data_addr: SocketAddr,
}

impl SimDevice {
    /// Bind the data socket, then connect to the host's control address
    /// in the background and run the firmware loop until RESTART.
    pub fn spawn(control_addr: SocketAddr) -> io::Result<Self> {
        let data = UdpSocket::bind(("127.0.0.1", 0))?;
        data.set_read_timeout(Some(Duration::from_millis(50)))?;
        let data_addr = data.local_addr()?;

        let state = Arc::new(Mutex::new(SimState::default()));
        let stop = Arc::new(AtomicBool::new(false));

        let loop_state = Arc::clone(&state);
        let loop_stop = Arc::clone(&stop);
        let worker = thread::Builder::new()
            .name("device-sim".into())
            .spawn(move || {
                if let Err(e) = firmware_loop(control_addr, data, loop_state, loop_stop) {
                    warn!("simulated device stopped: {}", e);
                }
            })?;

        Ok(Self {
            state,
            stop,
            worker: Some(worker),
            data_addr,
        })
    }

    /// Where the host should send UDP data.
    pub fn data_addr(&self) -> SocketAddr {
        self.data_addr
    }

    pub fn state(&self) -> Arc<Mutex<SimState>> {
        Arc::clone(&self.state)
    }

    /// Wait for the firmware loop to exit (it exits on RESTART).
    pub fn join(mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn firmware_loop(
    control_addr: SocketAddr,
    data: UdpSocket,
    state: Arc<Mutex<SimState>>,
    stop: Arc<AtomicBool>,
) -> io::Result<()> {
    let mut control = TcpStream::connect(control_addr)?;
    info!("simulated device connected to {}", control_addr);

    let mut buf = [0u8; 2048];
    while !stop.load(Ordering::Relaxed) {
        let (len, from) = match data.recv_from(&mut buf) {
            Ok(ok) => ok,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => return Err(e),
        };
        let pkt = &buf[..len];

        if len == 1 {
            match Command::from_byte(pkt[0]) {
                Some(Command::Home) => {
                    debug!("sim: homing");
                    state.lock().unwrap().homed = true;
                    // homed and holding: ready, and room for data
                    control.write_all(&[Command::Ready as u8])?;
                    control.write_all(&[Command::RequestData as u8])?;
                }
                Some(Command::CurrentValues) => {
                    let current = state.lock().unwrap().current();
                    let mut reply = [0u8; 2 * NUM_CHANNELS];
                    for (i, v) in current.iter().enumerate() {
                        LittleEndian::write_u16(&mut reply[2 * i..], *v);
                    }
                    data.send_to(&reply, from)?;
                }
                Some(Command::Restart) => {
                    debug!("sim: restart");
                    state.lock().unwrap().restarted = true;
                    return Ok(());
                }
                Some(other) => debug!("sim: ignoring {:?}", other),
                None => warn!("sim: unknown opcode {}", pkt[0]),
            }
            continue;
        }

        // DEFAULTS arrives as one packet: u16 opcode + one frame
        let defaults_len = 2 * (1 + NUM_CHANNELS);
        if len == defaults_len && LittleEndian::read_u16(pkt) == Command::Defaults as u16 {
            let mut frame = [0u16; NUM_CHANNELS];
            for (i, v) in frame.iter_mut().enumerate() {
                *v = LittleEndian::read_u16(&pkt[2 * (i + 1)..]);
            }
            debug!("sim: defaults {:?}", frame);
            state.lock().unwrap().defaults = Some(frame);
            continue;
        }

        // anything else is streamed frames
        if len % MotorCommand::BYTES_PER_FRAME == 0 {
            let chunk = MotorCommand::from_bytes(pkt);
            state.lock().unwrap().frames.extend_from_slice(chunk.frames());
            // stop-and-wait: ask for the next chunk only now
            control.write_all(&[Command::RequestData as u8])?;
        } else {
            warn!("sim: dropping malformed {} byte packet", len);
        }
    }
    Ok(())
}
