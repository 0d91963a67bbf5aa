use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};
use log::{error, trace, warn};

use super::ring::Ring;
use super::trb::Trb;
use crate::error::{Result, XhciError};

/// What the controller reported for one command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CommandCompletion {
    pub code: u8,
    pub slot_id: u8,
    /// Physical address of the command TRB this completion belongs to.
    pub command: u64,
}

impl CommandCompletion {
    pub fn from_event(event: &Trb) -> Self {
        Self {
            code: event.completion_code(),
            slot_id: event.event_slot(),
            command: event.read_data() & !0xF,
        }
    }

    pub fn result(&self) -> Result<()> {
        XhciError::check_command(self.code)
    }
}

/// The command ring and the channel of the single outstanding command.
pub struct CommandEngine {
    ring: Mutex<Ring>,
    /// The outstanding command's TRB address and the channel its completion goes to.
    pending: Mutex<Option<(u64, Sender<CommandCompletion>)>>,
    timeout: Duration,
}

impl CommandEngine {
    pub fn new(ring: Ring, timeout: Duration) -> Self {
        Self {
            ring: Mutex::new(ring),
            pending: Mutex::new(None),
            timeout,
        }
    }

    /// The value for CRCR: command ring enqueue pointer and cycle state.
    pub fn crcr(&self) -> u64 {
        self.ring.lock().unwrap().register()
    }

    /// Returns the command ring to its initial state. Only valid while the controller is halted.
    pub fn reset(&self) {
        self.ring.lock().unwrap().reset();
        self.pending.lock().unwrap().take();
    }

    /// Places one command on the ring, rings the doorbell and waits for its completion event.
    ///
    /// The ring lock is held until the completion arrives, so concurrent callers queue up
    /// behind each other. The raw completion is returned, whatever its code.
    pub fn submit<F, D>(&self, fill: F, ring_doorbell: D) -> Result<CommandCompletion>
    where
        F: FnOnce(&mut Trb, bool),
        D: FnOnce(),
    {
        let mut ring = self.ring.lock().unwrap();
        ring.room(1)?;

        let cursor = ring.enqueue_with(fill)?;
        let address = ring.physical(cursor);

        let (sender, receiver) = crossbeam_channel::bounded(1);
        *self.pending.lock().unwrap() = Some((address, sender));
        trace!("command {} at {:#X}", ring.trb(cursor), address);
        ring_doorbell();

        let received = receiver.recv_timeout(self.timeout);
        self.pending.lock().unwrap().take();
        ring.dequeue_through(cursor);

        match received {
            Ok(completion) => Ok(completion),
            Err(RecvTimeoutError::Timeout) => {
                error!(
                    "command at {:#X} did not complete within {:?}",
                    address, self.timeout
                );
                Err(XhciError::Fatal("command timed out"))
            }
            Err(RecvTimeoutError::Disconnected) => Err(XhciError::Fatal("command channel closed")),
        }
    }

    /// Like [CommandEngine::submit], with the completion code decoded.
    pub fn execute<F, D>(&self, fill: F, ring_doorbell: D) -> Result<CommandCompletion>
    where
        F: FnOnce(&mut Trb, bool),
        D: FnOnce(),
    {
        let completion = self.submit(fill, ring_doorbell)?;
        completion.result().map_err(|err| {
            warn!(
                "command failed with completion code {} (slot {}): {}",
                completion.code, completion.slot_id, err
            );
            err
        })?;
        Ok(completion)
    }

    /// Delivers a Command Completion event to the waiting issuer. Called by the event
    /// dispatcher, which never touches the command ring itself.
    ///
    /// A completion for any other TRB, such as one that arrives after its issuer timed out, is
    /// dropped and the pending command keeps waiting.
    pub fn complete(&self, completion: CommandCompletion) {
        let mut pending = self.pending.lock().unwrap();
        match pending.take() {
            Some((address, sender)) if address == completion.command => {
                let _ = sender.try_send(completion);
            }
            Some(other) => {
                error!(
                    "dropping completion for command {:#X} while waiting for {:#X}",
                    completion.command, other.0
                );
                *pending = Some(other);
            }
            None => warn!(
                "command completion with code {} for {:#X} while no command is pending",
                completion.code, completion.command
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xhci::trb::TrbCompletionCode;
    use std::cell::Cell;
    use std::sync::Arc;
    use std::thread;

    fn engine(timeout_ms: u64) -> Arc<CommandEngine> {
        Arc::new(CommandEngine::new(
            Ring::new(1, 4, true, 64).unwrap(),
            Duration::from_millis(timeout_ms),
        ))
    }

    /// Runs one command that the doorbell answers right away with `code`.
    fn answered(
        engine: &Arc<CommandEngine>,
        code: TrbCompletionCode,
        fill: impl FnOnce(&mut Trb, bool),
    ) -> Result<CommandCompletion> {
        let address = Cell::new(0);
        engine.execute(
            |trb, cycle| {
                fill(trb, cycle);
                address.set(trb as *const Trb as u64);
            },
            || {
                engine.complete(CommandCompletion {
                    code: code as u8,
                    slot_id: 5,
                    command: address.get(),
                })
            },
        )
    }

    #[test]
    fn concurrent_issuers_serialize() {
        let engine = engine(5000);
        let (doorbell, hardware) = crossbeam_channel::unbounded::<u64>();

        let controller = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let mut handled = 0;
                while let Ok(address) = hardware.recv() {
                    thread::sleep(Duration::from_millis(2));
                    // Nobody else may ring while a command is outstanding.
                    assert!(hardware.try_recv().is_err());
                    let trb = unsafe { &*(address as *const Trb) };
                    engine.complete(CommandCompletion {
                        code: TrbCompletionCode::Success as u8,
                        slot_id: trb.event_slot(),
                        command: address,
                    });
                    handled += 1;
                }
                handled
            })
        };

        let issuers: Vec<_> = (1..=4u8)
            .map(|slot| {
                let engine = Arc::clone(&engine);
                let doorbell = doorbell.clone();
                thread::spawn(move || {
                    for _ in 0..5 {
                        let address = Cell::new(0);
                        let completion = engine
                            .execute(
                                |trb, cycle| {
                                    trb.disable_slot(slot, cycle);
                                    address.set(trb as *const Trb as u64);
                                },
                                || doorbell.send(address.get()).unwrap(),
                            )
                            .unwrap();
                        assert_eq!(completion.slot_id, slot);
                    }
                })
            })
            .collect();

        for issuer in issuers {
            issuer.join().unwrap();
        }
        drop(doorbell);
        assert_eq!(controller.join().unwrap(), 20);

        let ring = engine.ring.lock().unwrap();
        assert_eq!(ring.available(), ring.total());
    }

    #[test]
    fn timeout_is_fatal_and_retires_the_command() {
        let engine = engine(20);
        let result = engine.execute(|trb, cycle| trb.no_op_cmd(cycle), || ());
        assert_eq!(result, Err(XhciError::Fatal("command timed out")));
        let ring = engine.ring.lock().unwrap();
        assert_eq!(ring.available(), ring.total());
    }

    #[test]
    fn completion_codes_are_decoded() {
        let engine = engine(5000);
        let completion = answered(&engine, TrbCompletionCode::Success, |trb, cycle| {
            trb.enable_slot(0, cycle)
        })
        .unwrap();
        assert_eq!(completion.slot_id, 5);

        assert_eq!(
            answered(&engine, TrbCompletionCode::NoSlotsAvailable, |trb, cycle| {
                trb.enable_slot(0, cycle)
            }),
            Err(XhciError::NoSlotsAvailable)
        );
        assert_eq!(
            answered(&engine, TrbCompletionCode::ContextState, |trb, cycle| {
                trb.stop_endpoint(1, 2, false, cycle)
            }),
            Err(XhciError::ContextStateError)
        );
        // The ring wraps a few times on the way.
        for _ in 0..10 {
            answered(&engine, TrbCompletionCode::Success, |trb, cycle| trb.no_op_cmd(cycle))
                .unwrap();
        }
    }

    #[test]
    fn completion_for_another_trb_is_dropped() {
        let engine = engine(5000);
        let address = Cell::new(0);
        let completion = engine
            .execute(
                |trb, cycle| {
                    trb.no_op_cmd(cycle);
                    address.set(trb as *const Trb as u64);
                },
                || {
                    engine.complete(CommandCompletion {
                        code: TrbCompletionCode::Stall as u8,
                        slot_id: 0,
                        command: 0xDEAD_0000,
                    });
                    engine.complete(CommandCompletion {
                        code: TrbCompletionCode::Success as u8,
                        slot_id: 3,
                        command: address.get(),
                    });
                },
            )
            .unwrap();
        assert_eq!(completion.slot_id, 3);
    }

    #[test]
    fn late_completion_does_not_fail_the_next_command() {
        let engine = engine(20);
        let late = Cell::new(0);
        let result = engine.execute(
            |trb, cycle| {
                trb.no_op_cmd(cycle);
                late.set(trb as *const Trb as u64);
            },
            || (),
        );
        assert_eq!(result, Err(XhciError::Fatal("command timed out")));

        let address = Cell::new(0);
        let completion = engine
            .execute(
                |trb, cycle| {
                    trb.enable_slot(0, cycle);
                    address.set(trb as *const Trb as u64);
                },
                || {
                    // The timed out command completes just as the next one is issued.
                    engine.complete(CommandCompletion {
                        code: TrbCompletionCode::Success as u8,
                        slot_id: 1,
                        command: late.get(),
                    });
                    engine.complete(CommandCompletion {
                        code: TrbCompletionCode::Success as u8,
                        slot_id: 2,
                        command: address.get(),
                    });
                },
            )
            .unwrap();
        assert_eq!(completion.slot_id, 2);
    }
}
