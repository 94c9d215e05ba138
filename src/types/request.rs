/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Client requests, the values that paxos instances agree on.

use std::fmt::{self, Debug, Formatter};
use std::io::{Read, Result as IoResult, Write};

use borsh::{BorshDeserialize, BorshSerialize};

use super::data_types::{ClientID, Data, RequestID};

/// An opaque client command.
///
/// The engine never interprets the `payload` of a request. It only cares about whether a request is a
/// [stop](RequestKind::Stop), which ends the paxos instance it is decided in, or a
/// [no-op](RequestKind::NoOp), which fills a slot without being handed to the [app](crate::app::App).
///
/// ## Batching
///
/// A request may carry further requests in `batched`. These are latched onto the outer request to
/// amortize the cost of agreement, and are executed directly after it, in order, in the same slot.
///
/// `Request` nests itself, so its borsh encoding is written out by hand below.
#[derive(Clone, PartialEq, Eq)]
pub struct Request {
    pub id: RequestID,
    pub client: ClientID,
    pub kind: RequestKind,
    pub payload: Data,
    pub batched: Vec<Request>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum RequestKind {
    Regular,
    NoOp,
    Stop,
}

impl Request {
    /// Create a regular request.
    pub fn new(id: RequestID, client: ClientID, payload: impl Into<Data>) -> Request {
        Request {
            id,
            client,
            kind: RequestKind::Regular,
            payload: payload.into(),
            batched: Vec::new(),
        }
    }

    /// Create a stop request. Once decided, no further request is executed in the paxos instance.
    pub fn stop(id: RequestID, client: ClientID, payload: impl Into<Data>) -> Request {
        Request {
            kind: RequestKind::Stop,
            ..Request::new(id, client, payload)
        }
    }

    /// Create the no-op request that coordinators use to fill slots that no replica has accepted a
    /// value for.
    pub fn no_op() -> Request {
        Request {
            id: RequestID::new(0),
            client: ClientID::new(0),
            kind: RequestKind::NoOp,
            payload: Data::default(),
            batched: Vec::new(),
        }
    }

    /// Latch `requests` together into a single request. Returns `None` if `requests` is empty.
    pub fn batch(mut requests: Vec<Request>) -> Option<Request> {
        if requests.is_empty() {
            return None;
        }
        let mut outer = requests.remove(0);
        outer.batched.extend(requests);
        Some(outer)
    }

    pub fn is_stop(&self) -> bool {
        self.kind == RequestKind::Stop
    }

    pub fn is_no_op(&self) -> bool {
        self.kind == RequestKind::NoOp
    }

    /// Turn this request into a stop, keeping its identity and payload.
    pub(crate) fn into_stop(self) -> Request {
        Request {
            kind: RequestKind::Stop,
            ..self
        }
    }

    /// Iterate through this request and the requests batched in it, in execution order.
    pub fn requests(&self) -> impl Iterator<Item = &Request> {
        std::iter::once(self).chain(self.batched.iter())
    }

    /// Get the IDs of this request and the requests batched in it.
    pub fn request_ids(&self) -> Vec<RequestID> {
        self.requests().map(|request| request.id).collect()
    }
}

impl BorshSerialize for Request {
    fn serialize<W: Write>(&self, writer: &mut W) -> IoResult<()> {
        self.id.serialize(writer)?;
        self.client.serialize(writer)?;
        self.kind.serialize(writer)?;
        self.payload.serialize(writer)?;
        self.batched.serialize(writer)
    }
}

impl BorshDeserialize for Request {
    fn deserialize_reader<R: Read>(reader: &mut R) -> IoResult<Self> {
        Ok(Request {
            id: RequestID::deserialize_reader(reader)?,
            client: ClientID::deserialize_reader(reader)?,
            kind: RequestKind::deserialize_reader(reader)?,
            payload: Data::deserialize_reader(reader)?,
            batched: Vec::<Request>::deserialize_reader(reader)?,
        })
    }
}

impl Debug for Request {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.kind {
            RequestKind::NoOp => write!(f, "NO_OP"),
            RequestKind::Stop => write!(f, "STOP[{}:{}]", self.client.int(), self.id),
            RequestKind::Regular if self.batched.is_empty() => {
                write!(f, "[{}:{}]", self.client.int(), self.id)
            }
            RequestKind::Regular => write!(
                f,
                "[{}:{}+{}]",
                self.client.int(),
                self.id,
                self.batched.len()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: u64) -> Request {
        Request::new(RequestID::new(id), ClientID::new(1), vec![id as u8])
    }

    #[test]
    fn batch_keeps_execution_order() {
        let batch = Request::batch(vec![request(1), request(2), request(3)]).unwrap();
        let ids: Vec<u64> = batch.requests().map(|r| r.id.int()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(Request::batch(Vec::new()).is_none());
    }

    #[test]
    fn batched_requests_survive_encoding() {
        let batch = Request::batch(vec![request(4), request(5).into_stop()]).unwrap();
        let bytes = batch.try_to_vec().unwrap();
        let decoded = Request::try_from_slice(&bytes).unwrap();
        assert_eq!(decoded, batch);
        assert_eq!(decoded.request_ids(), vec![RequestID::new(4), RequestID::new(5)]);
        assert!(decoded.batched[0].is_stop());
    }

    #[test]
    fn stop_conversion() {
        let stop = request(9).into_stop();
        assert!(stop.is_stop());
        assert_eq!(stop.id, RequestID::new(9));
        assert!(Request::no_op().is_no_op());
        assert!(!Request::no_op().is_stop());
    }
}
