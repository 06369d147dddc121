use nt_api::{NtResult, NtStatus};
use nt_sync::{SlotChannel, WriterClosed};

use crate::message::{ApcCall, ApcResult, Reply, Request};

/// Identifies a connection to the server that issued it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[repr(transparent)]
pub struct ConnectionId(pub u64);

/// One thread's duplex channel to the server.
///
/// The client side issues [`call`](Self::call)s one at a time and is the only
/// writer of requests; the server side answers every request with exactly one
/// reply. Both directions are single-slot, which the strict alternation makes
/// sufficient.
pub struct Connection {
    id: ConnectionId,
    to_server: SlotChannel<Request>,
    to_client: SlotChannel<Reply>,
}

impl Connection {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            to_server: SlotChannel::new(),
            to_client: SlotChannel::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Sends `request` and blocks for its reply.
    ///
    /// Safe to use from a signal handler as long as the interrupted code
    /// isn't itself inside `call` on the same connection.
    pub fn call(&self, request: Request) -> NtResult<Reply> {
        // Once the server has gone away nobody drains the request slot.
        if self.to_client.is_writer_closed() {
            return Err(NtStatus::PIPE_DISCONNECTED);
        }
        self.to_server.send(request);
        self.to_client
            .receive()
            .map_err(|WriterClosed| NtStatus::PIPE_DISCONNECTED)
    }

    /// Client side: no further requests will be sent.
    pub fn close(&self) {
        self.to_server.close_writer();
    }

    /// Server side: blocks for the next request. Fails once the client has
    /// closed.
    pub fn next_request(&self) -> Result<Request, WriterClosed> {
        self.to_server.receive()
    }

    /// Server side: answers the request last returned by
    /// [`next_request`](Self::next_request).
    pub fn reply(&self, reply: Reply) {
        self.to_client.send(reply);
    }

    /// Server side: the server will not answer any more requests.
    pub fn disconnect(&self) {
        self.to_client.close_writer();
    }
}

impl core::fmt::Debug for Connection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish()
    }
}

/// A process's control channel. Unlike [`Connection`], the *server* is the
/// caller here: it issues [`ApcCall`]s that the process executes and answers.
pub struct ControlConnection {
    calls: SlotChannel<ApcCall>,
    results: SlotChannel<ApcResult>,
}

impl ControlConnection {
    pub fn new() -> Self {
        Self {
            calls: SlotChannel::new(),
            results: SlotChannel::new(),
        }
    }

    /// Server side: runs `call` in the process and waits for its result.
    /// Callers must serialize; at most one call may be in flight.
    pub fn request(&self, call: ApcCall) -> NtResult<ApcResult> {
        if self.calls.is_writer_closed() || self.results.is_writer_closed() {
            return Err(NtStatus::PROCESS_IS_TERMINATING);
        }
        self.calls.send(call);
        self.results
            .receive()
            .map_err(|WriterClosed| NtStatus::PROCESS_IS_TERMINATING)
    }

    /// Server side: no more calls will be routed to the process.
    pub fn shutdown(&self) {
        self.calls.close_writer();
    }

    /// Process side: blocks for the next call. Fails after
    /// [`shutdown`](Self::shutdown).
    pub fn next_call(&self) -> Result<ApcCall, WriterClosed> {
        self.calls.receive()
    }

    /// Process side: answers the call last returned by
    /// [`next_call`](Self::next_call).
    pub fn complete(&self, result: ApcResult) {
        self.results.send(result);
    }

    /// Process side: the process will not serve any more calls.
    pub fn close(&self) {
        self.results.close_writer();
    }
}

impl Default for ControlConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use nt_api::Handle;

    use super::*;
    use crate::message::CreateThreadRequest;

    #[test_log::test]
    fn test_call_round_trip() {
        let conn = Arc::new(Connection::new(ConnectionId(1)));
        let server = {
            let conn = conn.clone();
            std::thread::spawn(move || {
                while let Ok(req) = conn.next_request() {
                    let reply = match req {
                        Request::SuspendThread(_) => Reply::SuspendCount(3),
                        _ => Reply::Status(NtStatus::NOT_IMPLEMENTED),
                    };
                    conn.reply(reply);
                }
            })
        };
        assert!(matches!(
            conn.call(Request::SuspendThread(Handle::CURRENT_THREAD)),
            Ok(Reply::SuspendCount(3))
        ));
        assert!(matches!(
            conn.call(Request::TestAlert),
            Ok(Reply::Status(NtStatus::NOT_IMPLEMENTED))
        ));
        conn.close();
        server.join().unwrap();
    }

    #[test_log::test]
    fn test_disconnected_server() {
        let conn = Connection::new(ConnectionId(2));
        conn.disconnect();
        assert_eq!(
            conn.call(Request::TestAlert).err(),
            Some(NtStatus::PIPE_DISCONNECTED)
        );
        // A second call must not trip over the undrained request slot.
        assert_eq!(
            conn.call(Request::TestAlert).err(),
            Some(NtStatus::PIPE_DISCONNECTED)
        );
    }

    #[test_log::test]
    fn test_control_round_trip() {
        let control = Arc::new(ControlConnection::new());
        let process = {
            let control = control.clone();
            std::thread::spawn(move || {
                let mut served = 0;
                while let Ok(ApcCall::CreateThread(req)) = control.next_call() {
                    control.complete(ApcResult::CreateThread {
                        status: NtStatus::SUCCESS,
                        handle: Handle::from_raw(4),
                        tid: req.arg as u32,
                    });
                    served += 1;
                }
                control.close();
                served
            })
        };
        let req = CreateThreadRequest {
            entry: 0x1000,
            arg: 44,
            stack_reserve: 0,
            stack_commit: 0,
            suspended: false,
            access: nt_api::ThreadAccess::ALL_ACCESS,
        };
        assert_eq!(
            control.request(ApcCall::CreateThread(req)),
            Ok(ApcResult::CreateThread {
                status: NtStatus::SUCCESS,
                handle: Handle::from_raw(4),
                tid: 44,
            })
        );
        control.shutdown();
        assert_eq!(process.join().unwrap(), 1);
        assert_eq!(
            control.request(ApcCall::CreateThread(req)),
            Err(NtStatus::PROCESS_IS_TERMINATING)
        );
    }
}
