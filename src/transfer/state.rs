// The transfer state machine.
//
// Requester (client) side:
//
//   SendReadRequest  --Data(1)--------------------------> Receiving
//                    --OACK / send Ack(0)---------------> Receiving
//   SendWriteRequest --Ack(0) or OACK-------------------> Sending
//
// Responder (server) side:
//
//   SendOptionAck(read)  --Ack(0)-----------------------> Sending
//   SendOptionAck(write) --Data(1)----------------------> Receiving
//   AcknowledgeWriteRequest (sends Ack(0)) -------------> Receiving
//
// Sending loops on itself, one block per matching Ack, and Receiving loops on itself, one block
// per in-sequence Data. Every state reaches Closed on completion, timeout, cancel, a peer Error
// packet or a local I/O failure. Packets a state does not expect are dropped without a reply.

use super::context::TransferContext;
use super::error::{Outcome, TransferError};
use crate::options::{self, OptionRequest};
use crate::tftp::{ErrorCode, Packet, TftpOption};

/// Which way data flows once options are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// The externally visible name of a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    SendReadRequest,
    SendWriteRequest,
    SendOptionAck,
    AcknowledgeWriteRequest,
    Sending,
    Receiving,
    Closed,
}

pub(crate) enum State {
    SendReadRequest { request: Packet, options: OptionRequest },
    SendWriteRequest { request: Packet, options: OptionRequest },
    SendOptionAck { options: Vec<TftpOption>, direction: Direction },
    AcknowledgeWriteRequest,
    /// `len` and `is_last` describe the block in flight and are filled in on entry.
    Sending { len: usize, is_last: bool },
    Receiving,
    Closed,
}

/// What the engine should do after a handler ran.
pub(crate) enum Next {
    Stay,
    Enter(State),
    /// Enter the state, then hand it the packet that caused the transition.
    Forward(State, Packet),
    Close(Outcome),
}

impl State {
    pub(crate) fn sending() -> State {
        State::Sending { len: 0, is_last: false }
    }

    pub(crate) fn kind(&self) -> StateKind {
        match self {
            State::SendReadRequest { .. } => StateKind::SendReadRequest,
            State::SendWriteRequest { .. } => StateKind::SendWriteRequest,
            State::SendOptionAck { .. } => StateKind::SendOptionAck,
            State::AcknowledgeWriteRequest => StateKind::AcknowledgeWriteRequest,
            State::Sending { .. } => StateKind::Sending,
            State::Receiving => StateKind::Receiving,
            State::Closed => StateKind::Closed,
        }
    }

    pub(crate) fn on_enter(&mut self, ctx: &mut TransferContext) -> Next {
        match self {
            State::SendReadRequest { request, .. } | State::SendWriteRequest { request, .. } => {
                ctx.send(request.clone());
                Next::Stay
            },
            State::SendOptionAck { options, .. } => {
                ctx.send(Packet::OptionAck { options: options.clone() });
                Next::Stay
            },
            State::AcknowledgeWriteRequest => {
                ctx.block_counter = 0;
                ctx.send(Packet::Ack { block: 0 });
                Next::Enter(State::Receiving)
            },
            State::Sending { len, is_last } => {
                let data = match ctx.read_block() {
                    Ok(data) => data,
                    Err(e) => return Next::Close(Outcome::Failed(ctx.local_failure(e))),
                };
                *len = data.len();
                *is_last = data.len() < ctx.block_size;
                ctx.send(Packet::Data { block: ctx.block_counter, data });
                Next::Stay
            },
            State::Receiving | State::Closed => Next::Stay,
        }
    }

    pub(crate) fn on_command(&mut self, ctx: &mut TransferContext, packet: Packet) -> Next {
        if let State::Closed = self {
            return Next::Stay;
        }

        if let Packet::Error { code, message } = packet {
            log::warn!("Peer {} sent error {:?}: '{}'", ctx.peer(), code, message);
            return Next::Close(Outcome::Failed(TransferError::Remote { code, message }));
        }

        // A payload never exceeds the block size in effect.
        if let Packet::Data { block, data } = &packet {
            if data.len() > ctx.block_size {
                log::debug!(
                    "Dropping block {} from {}: {} bytes exceeds block size {}",
                    block, ctx.peer(), data.len(), ctx.block_size
                );
                return Next::Stay;
            }
        }

        match (self, packet) {
            (State::SendReadRequest { .. }, packet @ Packet::Data { block: 1, .. }) => {
                // The peer ignored our options, or we asked for none.
                ctx.block_counter = 0;
                Next::Forward(State::Receiving, packet)
            },
            (State::SendReadRequest { options, .. }, Packet::OptionAck { options: acked }) => {
                match negotiate(ctx, options, &acked) {
                    Ok(()) => {
                        ctx.block_counter = 0;
                        ctx.send(Packet::Ack { block: 0 });
                        Next::Enter(State::Receiving)
                    },
                    Err(outcome) => outcome,
                }
            },
            (State::SendWriteRequest { .. }, Packet::Ack { block: 0 }) => {
                ctx.block_counter = 1;
                Next::Enter(State::sending())
            },
            (State::SendWriteRequest { options, .. }, Packet::OptionAck { options: acked }) => {
                match negotiate(ctx, options, &acked) {
                    Ok(()) => {
                        ctx.block_counter = 1;
                        Next::Enter(State::sending())
                    },
                    Err(outcome) => outcome,
                }
            },
            (State::SendOptionAck { direction: Direction::Send, .. }, Packet::Ack { block: 0 }) => {
                ctx.block_counter = 1;
                Next::Enter(State::sending())
            },
            (State::SendOptionAck { direction: Direction::Receive, .. }, packet @ Packet::Data { block: 1, .. }) => {
                ctx.block_counter = 0;
                Next::Forward(State::Receiving, packet)
            },
            (State::Sending { len, is_last }, Packet::Ack { block }) if block == ctx.block_counter => {
                ctx.add_progress(*len);
                if *is_last {
                    return Next::Close(Outcome::Completed);
                }
                ctx.block_counter = ctx.block_counter.wrapping_add(1);
                Next::Enter(State::sending())
            },
            (State::Receiving, Packet::Data { block, data }) if block == ctx.block_counter.wrapping_add(1) => {
                receive_block(ctx, block, data)
            },
            (state, packet) => {
                log::debug!(
                    "Ignoring {:?} from {} in state {:?}",
                    packet.op_code(), ctx.peer(), state.kind()
                );
                Next::Stay
            },
        }
    }

    pub(crate) fn on_timer(&mut self, ctx: &mut TransferContext) -> Next {
        if let State::Closed = self {
            return Next::Stay;
        }
        if !ctx.timer_expired() {
            return Next::Stay;
        }
        if ctx.retries_used >= ctx.retry_count {
            log::warn!("No answer from {} after {} retries, giving up", ctx.peer(), ctx.retries_used);
            return Next::Close(Outcome::Failed(TransferError::Timeout));
        }
        ctx.resend();
        Next::Stay
    }

    pub(crate) fn on_cancel(&mut self, ctx: &mut TransferContext, code: ErrorCode) -> Next {
        if let State::Closed = self {
            return Next::Stay;
        }
        ctx.send_error(code, "Transfer cancelled".to_string());
        Next::Close(Outcome::Cancelled(code))
    }
}

fn negotiate(ctx: &mut TransferContext, requested: &OptionRequest, acked: &[TftpOption]) -> Result<(), Next> {
    match options::apply_ack(requested, acked) {
        Ok(negotiated) => {
            ctx.apply_negotiated(&negotiated);
            Ok(())
        },
        Err(e) => {
            ctx.send_error(ErrorCode::OptionNegotiation, e.to_string());
            Err(Next::Close(Outcome::Failed(e.into())))
        },
    }
}

fn receive_block(ctx: &mut TransferContext, block: u16, data: Vec<u8>) -> Next {
    if let Err(e) = ctx.write_block(&data) {
        return Next::Close(Outcome::Failed(ctx.local_failure(e)));
    }
    ctx.block_counter = block;
    ctx.last_received_block = Some(block);
    ctx.add_progress(data.len());

    if data.len() < ctx.block_size {
        // Make sure the data is where it belongs before telling the peer we are done.
        if let Err(e) = ctx.release_channel() {
            return Next::Close(Outcome::Failed(ctx.local_failure(e)));
        }
        ctx.send(Packet::Ack { block });
        return Next::Close(Outcome::Completed);
    }

    ctx.send(Packet::Ack { block });
    Next::Stay
}

/// Entry into Closed. Every way a transfer ends passes through here exactly once.
pub(crate) fn close(ctx: &mut TransferContext, outcome: Outcome) -> Outcome {
    let outcome = match ctx.release_channel() {
        Ok(()) => outcome,
        Err(e) if outcome == Outcome::Completed => Outcome::Failed(e.into()),
        Err(e) => {
            log::warn!("Failed to release byte channel for {}: {}", ctx.peer(), e);
            outcome
        },
    };
    ctx.notify_outcome(&outcome);
    outcome
}
