//! In-memory transport fakes shared by unit and integration tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::transport::{Transport, TransportConnector, TransportError};

/// Scriptable in-memory transport.
///
/// Outbound frames are captured for assertions; inbound frames are fed
/// through an mpsc channel so tests control arrival order and timing.
pub struct MockTransport {
    sent: Mutex<Vec<String>>,
    inbound_tx: mpsc::UnboundedSender<String>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    fail_sends: AtomicBool,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            fail_sends: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Queue an inbound text frame for the receive loop.
    pub fn push_inbound(&self, text: impl Into<String>) {
        let _ = self.inbound_tx.send(text.into());
    }

    /// Everything sent so far, oldest first.
    pub fn sent_frames(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Make subsequent sends fail with a transport error.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Sever the connection: pending and future recv calls return `Closed`.
    pub fn sever(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.inbound_tx.send(String::new());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, text: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::WebSocket("injected send failure".to_string()));
        }
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn recv(&self) -> Result<String, TransportError> {
        let mut rx = self.inbound_rx.lock().await;
        loop {
            match rx.recv().await {
                Some(text) => {
                    if self.closed.load(Ordering::SeqCst) {
                        return Err(TransportError::Closed);
                    }
                    if text.is_empty() {
                        continue;
                    }
                    return Ok(text);
                }
                None => return Err(TransportError::Closed),
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.inbound_tx.send(String::new());
        Ok(())
    }
}

/// Connector that hands out pre-built mock transports in order and can be
/// told to fail the next N dials.
pub struct MockConnector {
    transports: Mutex<VecDeque<Arc<MockTransport>>>,
    fail_next: AtomicU32,
    dial_count: AtomicU32,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            transports: Mutex::new(VecDeque::new()),
            fail_next: AtomicU32::new(0),
            dial_count: AtomicU32::new(0),
        })
    }

    /// Supply the transport returned by the next successful dial.
    pub fn push_transport(&self, transport: Arc<MockTransport>) {
        self.transports.lock().unwrap().push_back(transport);
    }

    /// Fail the next `n` dials before succeeding again.
    pub fn fail_next_dials(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn dial_count(&self) -> u32 {
        self.dial_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn connect(&self, _address: &str) -> Result<Arc<dyn Transport>, TransportError> {
        self.dial_count.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Connect("injected dial failure".to_string()));
        }

        match self.transports.lock().unwrap().pop_front() {
            Some(transport) => Ok(transport),
            None => Err(TransportError::Connect("no transport available".to_string())),
        }
    }
}
