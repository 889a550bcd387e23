use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

/// External interrupt source backed by a pipe or file.
///
/// A reader thread forwards every byte it reads; the simulation loop polls
/// without blocking. Each byte names the thread to interrupt.
pub struct InterruptPipe {
    rx: mpsc::Receiver<u8>,
    running: Arc<AtomicBool>,
}

impl InterruptPipe {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self::from_reader(file))
    }

    pub fn from_reader<R: Read + Send + 'static>(mut reader: R) -> Self {
        let (tx, rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));
        let r_clone = running.clone();

        thread::spawn(move || {
            let mut buf = [0u8; 1];
            while r_clone.load(Ordering::Relaxed) {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send(buf[0]).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::warn!("interrupt pipe read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Self { rx, running }
    }

    pub fn poll(&self) -> Option<u8> {
        self.rx.try_recv().ok()
    }
}

impl Drop for InterruptPipe {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}
