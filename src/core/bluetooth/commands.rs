//! Command queue
//! One FIFO per device with at most one write in flight, and a settle delay
//! after every write so the controller has time to process the frame.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::oneshot;
use tokio::time::sleep;

use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::transport::BleTransport;
use crate::core::bluetooth::types::WriteKind;
use crate::core::protocol::{handshake_frames, Frame, Variant};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Writes one frame to a device
#[async_trait]
pub trait CommandSender: Send + Sync {
    async fn send_frame(&self, frame: &[u8]) -> Result<(), BleError>;
}

/// Sends frames to a resolved characteristic through the transport
pub struct CharacteristicWriter<T: BleTransport> {
    transport: Arc<T>,
    characteristic: T::Characteristic,
    kind: WriteKind,
}

impl<T: BleTransport> CharacteristicWriter<T> {
    pub fn new(transport: Arc<T>, characteristic: T::Characteristic, kind: WriteKind) -> Self {
        Self {
            transport,
            characteristic,
            kind,
        }
    }
}

#[async_trait]
impl<T: BleTransport> CommandSender for CharacteristicWriter<T> {
    async fn send_frame(&self, frame: &[u8]) -> Result<(), BleError> {
        self.transport
            .write(&self.characteristic, frame, self.kind)
            .await
    }
}

/// Runs the power-on sequence some variants need before normal commands
pub struct CommandExecutor<'a> {
    command_sender: &'a dyn CommandSender,
}

impl<'a> CommandExecutor<'a> {
    pub fn new(command_sender: &'a dyn CommandSender) -> Self {
        Self { command_sender }
    }

    pub async fn initialize_controller(
        &self,
        variant: Variant,
        delay: Duration,
    ) -> Result<(), BleError> {
        let frames = handshake_frames(variant);
        if frames.is_empty() {
            return Ok(());
        }
        for frame in &frames {
            info!("Sending handshake frame [{}] for {}", frame, variant);
            self.command_sender.send_frame(frame.as_bytes()).await?;
            sleep(delay).await;
        }
        info!("Controller initialized");
        Ok(())
    }
}

struct QueueEntry {
    frame: Frame,
    reply: oneshot::Sender<Result<(), BleError>>,
}

struct DeviceQueue {
    sender: Arc<dyn CommandSender>,
    pending: VecDeque<QueueEntry>,
    processing: bool,
    closed: bool,
}

/// Resolves when the specific queued frame has been written (or failed).
/// Entries abandoned by a disconnect resolve to `BleError::Cancelled`.
#[must_use = "the command result is only observed by awaiting it"]
pub struct PendingCommand(oneshot::Receiver<Result<(), BleError>>);

impl Future for PendingCommand {
    type Output = Result<(), BleError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(BleError::Cancelled)))
    }
}

#[derive(Clone)]
pub struct CommandQueue {
    queues: Arc<Mutex<HashMap<String, Arc<Mutex<DeviceQueue>>>>>,
    settle_delay: Duration,
}

impl CommandQueue {
    pub fn new(settle_delay: Duration) -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            settle_delay,
        }
    }

    /// Opens a queue for `device_id`, discarding any previous one.
    pub fn register(&self, device_id: &str, sender: Arc<dyn CommandSender>) {
        let queue = Arc::new(Mutex::new(DeviceQueue {
            sender,
            pending: VecDeque::new(),
            processing: false,
            closed: false,
        }));
        let previous = lock(&self.queues).insert(device_id.to_string(), queue);
        if let Some(previous) = previous {
            Self::close(device_id, &previous);
        }
    }

    pub fn is_registered(&self, device_id: &str) -> bool {
        lock(&self.queues).contains_key(device_id)
    }

    /// Appends a frame to the device's queue, starting its worker if idle.
    pub fn enqueue(&self, device_id: &str, frame: Frame) -> Result<PendingCommand, BleError> {
        let queue = lock(&self.queues)
            .get(device_id)
            .cloned()
            .ok_or_else(|| BleError::NotConnected(device_id.to_string()))?;

        let (reply, receiver) = oneshot::channel();
        let start_worker = {
            let mut state = lock(&queue);
            state.pending.push_back(QueueEntry { frame, reply });
            !std::mem::replace(&mut state.processing, true)
        };

        if start_worker {
            tokio::spawn(Self::drain(device_id.to_string(), queue, self.settle_delay));
        }
        Ok(PendingCommand(receiver))
    }

    /// Drops the device's queue. Entries still waiting are rejected with
    /// `Cancelled`; a write already in flight runs to completion.
    pub fn discard(&self, device_id: &str) -> usize {
        match lock(&self.queues).remove(device_id) {
            Some(queue) => Self::close(device_id, &queue),
            None => 0,
        }
    }

    pub fn pending(&self, device_id: &str) -> usize {
        lock(&self.queues)
            .get(device_id)
            .map(|queue| lock(queue).pending.len())
            .unwrap_or(0)
    }

    fn close(device_id: &str, queue: &Mutex<DeviceQueue>) -> usize {
        let abandoned: Vec<QueueEntry> = {
            let mut state = lock(queue);
            state.closed = true;
            state.pending.drain(..).collect()
        };
        let count = abandoned.len();
        for entry in abandoned {
            let _ = entry.reply.send(Err(BleError::Cancelled));
        }
        if count > 0 {
            info!("Discarded {} queued command(s) for {}", count, device_id);
        }
        count
    }

    async fn drain(device_id: String, queue: Arc<Mutex<DeviceQueue>>, settle_delay: Duration) {
        loop {
            let (entry, sender) = {
                let mut state = lock(&queue);
                let next = if state.closed {
                    None
                } else {
                    state.pending.pop_front()
                };
                match next {
                    Some(entry) => (entry, state.sender.clone()),
                    None => {
                        state.processing = false;
                        return;
                    }
                }
            };

            debug!("Writing [{}] to {}", entry.frame, device_id);
            let result = sender.send_frame(entry.frame.as_bytes()).await;
            if let Err(e) = &result {
                warn!("Write to {} failed: {}", device_id, e);
            }
            let _ = entry.reply.send(result);

            sleep(settle_delay).await;
        }
    }
}
