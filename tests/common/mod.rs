//! A rack simulator listening on a loopback port.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Analog register `n` reads as `ANALOG_BASE + n`.
pub const ANALOG_BASE: u16 = 100;
/// Every digital slot reads as this word, channels 0 and 2 are on.
pub const DIGITAL_WORD: u16 = 0x0005;

const ANALOG_REGISTERS: u16 = 64;
const DIGITAL_COILS: u16 = 128;

pub struct FakeDevice {
    port: u16,
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    closed: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FakeDevice {
    /// Accepts a single client connection on an ephemeral port.
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let handle = {
            let frames = Arc::clone(&frames);
            let closed = Arc::clone(&closed);
            thread::spawn(move || {
                if let Ok((stream, _)) = listener.accept() {
                    serve(stream, &frames);
                }
                closed.store(true, Ordering::SeqCst);
            })
        };
        Self {
            port,
            frames,
            closed,
            handle: Some(handle),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Every request frame received so far.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }

    /// Function codes of every request received so far.
    pub fn functions(&self) -> Vec<u8> {
        self.frames().iter().map(|frame| frame[7]).collect()
    }

    /// Waits until the client has closed its connection.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.closed.load(Ordering::SeqCst) {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        // Unblocks a pending accept when no client ever connected.
        let _ = TcpStream::connect(("127.0.0.1", self.port));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve(mut stream: TcpStream, frames: &Mutex<Vec<Vec<u8>>>) {
    let mut buf = [0u8; 512];
    loop {
        let received = match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(received) => received,
        };
        let request = buf[..received].to_vec();
        frames.lock().unwrap().push(request.clone());
        if stream.write_all(&respond(&request)).is_err() {
            return;
        }
    }
}

fn respond(request: &[u8]) -> Vec<u8> {
    if request.len() < 12 {
        return request.to_vec();
    }
    let function = request[7];
    let start = u16::from_be_bytes([request[8], request[9]]);
    let quantity = u16::from_be_bytes([request[10], request[11]]);
    let data: Vec<u8> = match function {
        0x04 => (start..(start + quantity).min(ANALOG_REGISTERS))
            .flat_map(|register| (ANALOG_BASE + register).to_be_bytes())
            .collect(),
        0x01 => {
            let end = (start + quantity).min(DIGITAL_COILS);
            let mut bytes = vec![0u8; usize::from(end.saturating_sub(start)).div_ceil(8)];
            for (i, coil) in (start..end).enumerate() {
                if DIGITAL_WORD & (1 << (coil % 16)) != 0 {
                    bytes[i / 8] |= 1 << (i % 8);
                }
            }
            bytes
        }
        // Writes are echoed.
        _ => return request[..12].to_vec(),
    };
    let mut response = vec![0x00, 0x00, 0x00, 0x00];
    response.extend_from_slice(&(3 + data.len() as u16).to_be_bytes());
    response.extend_from_slice(&[request[6], function, data.len() as u8]);
    response.extend_from_slice(&data);
    response
}
