//! Event pump: turns plugin notifications into unsolicited event lines.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use cuehost_session::HostEvent;

use crate::commands::HostContext;
use crate::protocol::Outgoing;

pub struct EventPump {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl EventPump {
    /// Poll every instance each `interval` and forward host events to the
    /// writer.
    ///
    /// Instances busy with a command are skipped for that round; the
    /// command itself drains what it observes.
    pub fn start(
        ctx: Arc<HostContext>,
        events: Receiver<HostEvent>,
        out: Sender<Outgoing>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("event-pump".to_string())
            .spawn(move || run(&ctx, &events, &out, interval, &flag))?;
        Ok(Self { stop, thread })
    }

    /// Stop after one last poll and drain.
    pub fn stop(self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.thread.join();
    }
}

fn run(
    ctx: &HostContext,
    events: &Receiver<HostEvent>,
    out: &Sender<Outgoing>,
    interval: Duration,
    stop: &AtomicBool,
) {
    loop {
        let stopping = stop.load(Ordering::Acquire);

        for slot in ctx.registry.snapshot() {
            if let Some(mut instance) = slot.try_lock() {
                instance.pump();
            }
        }
        while let Ok(event) = events.try_recv() {
            forward(out, event);
        }
        if stopping {
            break;
        }

        // Sleeping on the channel lets crash events emitted by commands go
        // out without waiting for the next poll.
        match events.recv_timeout(interval) {
            Ok(event) => forward(out, event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => thread::sleep(interval),
        }
    }
}

fn forward(out: &Sender<Outgoing>, event: HostEvent) {
    tracing::debug!("Event for handle {}: {event:?}", event.handle());
    let _ = out.send(event.into());
}
