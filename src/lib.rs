// An implementation of TFTP (RFC 1350) with option negotiation (RFC 2347, 2348, 2349).
//
// Transfer begins with request to read or write a file (also req for connection).
// If server grants request, connection is opened, file is sent in blocks of 512 bytes (or the
// negotiated block size). Each data packet contains one block and must be acked before the next
// one is sent.
//
// On data loss, intended recipient times out and may retransmit last packet (data or ack),
// causing sender to retransmit the lost packet. Sender has to keep one packet for
// retransmission.
//
// Most errors cause connection to terminate. Err is signaled w/ error packet, which is never
// acked nor retransmitted. Timeouts are used to detect the case where the error packet gets lost.
//
// Transfer identifiers (TIDs) are UDP ports. The requester sends its request to port 69; the
// responder answers from a port of its own choosing, and both sides stick to that pair. A packet
// from any other port is answered with an Unknown TID error without disturbing the transfer.
//
// End of transfer is marked by a DATA packet shorter than the block size. When a file is an exact
// multiple of the block size, a final empty DATA packet is sent.
//
// Layout:
//  - tftp:       packet model, wire codec and the UDP socket wrapper
//  - options:    option negotiation
//  - transfer:   the per-transfer state machine and the engine that drives it
//  - transport:  where the engine puts outgoing packets
//  - connection: runs one transfer over one socket
//  - srv_conn:   turns a request into a running transfer on the server
//  - server:     the listening loop
//  - client:     get / put

pub mod client;
pub mod connection;
pub mod options;
pub mod server;
pub mod srv_conn;
pub mod tftp;
pub mod transfer;
pub mod transport;
