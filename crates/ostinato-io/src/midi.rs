//! Hardware MIDI input bridge.
//!
//! A midir connection (which runs its own device thread) timestamps
//! incoming events and pushes them into a bounded channel; the backend
//! drains them into the block context at `begin_block`, converting each
//! arrival time into a sample offset within the current block.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use midir::{MidiInput, MidiInputConnection};
use ostinato_core::EventRecord;
use std::time::Instant;

const EVENT_QUEUE_SIZE: usize = 256;

pub(crate) struct MidiBridge {
    connection: Option<MidiInputConnection<Sender<(Instant, EventRecord)>>>,
    events: Receiver<(Instant, EventRecord)>,
    /// Start of the block currently being produced, approximated by the
    /// time of the previous drain.
    block_start: Instant,
}

impl MidiBridge {
    /// Connect to the first available input port. Returns None when no
    /// port is present; MIDI is optional for a device backend.
    pub(crate) fn start(client_name: &str) -> Option<Self> {
        let input = match MidiInput::new(client_name) {
            Ok(input) => input,
            Err(err) => {
                tracing::warn!(%err, "MIDI input unavailable");
                return None;
            }
        };

        let ports = input.ports();
        let Some(port) = ports.first() else {
            tracing::info!("no MIDI input ports");
            return None;
        };
        let port_name = input.port_name(port).unwrap_or_else(|_| "unknown".to_string());

        let (tx, rx) = bounded(EVENT_QUEUE_SIZE);
        let connection = input.connect(
            port,
            "ostinato-input",
            |_timestamp, bytes, tx| {
                if bytes.is_empty() || bytes.len() > 3 {
                    return;
                }
                // The offset is filled in at drain time, relative to the
                // block the event lands in.
                let event = (Instant::now(), EventRecord::from_bytes(0, bytes));
                if let Err(TrySendError::Full(_)) = tx.try_send(event) {
                    tracing::warn!("MIDI event queue full, dropping event");
                }
            },
            tx,
        );

        match connection {
            Ok(connection) => {
                tracing::info!(port = %port_name, "MIDI input connected");
                Some(Self {
                    connection: Some(connection),
                    events: rx,
                    block_start: Instant::now(),
                })
            }
            Err(err) => {
                tracing::warn!(%err, "failed to connect MIDI input");
                None
            }
        }
    }

    /// Drain pending events into `out`, tagging each with its in-block
    /// sample offset derived from its arrival time.
    pub(crate) fn drain_into(
        &mut self,
        sample_rate: u32,
        block_size: u32,
        out: &mut Vec<EventRecord>,
    ) {
        let max_offset = block_size.saturating_sub(1);
        while let Ok((arrived, mut event)) = self.events.try_recv() {
            let elapsed = arrived.saturating_duration_since(self.block_start);
            let offset = (elapsed.as_secs_f64() * sample_rate as f64) as u32;
            event.frame_offset = offset.min(max_offset);
            out.push(event);
        }
        self.block_start = Instant::now();
    }

    /// Close the connection, stopping the device thread.
    pub(crate) fn stop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }
}

impl Drop for MidiBridge {
    fn drop(&mut self) {
        self.stop();
    }
}
