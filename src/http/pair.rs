use std::cmp::Ordering;

use crate::http::chunk::ChunkSequence;
use crate::http::request::{Method, Request};
use crate::http::response::{Body, Response};

/// One request and, once it has arrived, its response.
///
/// Pairs order by the request's sequence number, which is what keeps the
/// connection's pending and queued sets draining in arrival order.
#[derive(Debug)]
pub struct Pair {
    sequence: u64,
    request: Request,
    response: Option<Response>,
    chunks: Option<ChunkSequence>,
    head_sent: bool,
}

impl Pair {
    pub fn new(request: Request) -> Self {
        Self {
            sequence: request.sequence,
            request,
            response: None,
            chunks: None,
            head_sent: false,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn response_mut(&mut self) -> Option<&mut Response> {
        self.response.as_mut()
    }

    pub fn has_response(&self) -> bool {
        self.response.is_some()
    }

    /// Attaches the response. A segmented body gets a [`ChunkSequence`],
    /// except for HEAD requests, which never send a body.
    pub fn set_http_response(&mut self, response: Response, threshold: usize) {
        self.chunks = match (&response.body, &self.request.method) {
            (Body::Chunked(head), method) if *method != Method::HEAD => {
                Some(ChunkSequence::new(head.clone(), threshold))
            }
            _ => None,
        };
        self.response = Some(response);
    }

    pub fn chunks(&self) -> Option<&ChunkSequence> {
        self.chunks.as_ref()
    }

    pub fn chunks_mut(&mut self) -> Option<&mut ChunkSequence> {
        self.chunks.as_mut()
    }

    pub fn head_sent(&self) -> bool {
        self.head_sent
    }

    pub fn mark_head_sent(&mut self) {
        self.head_sent = true;
    }

    /// Nothing is left to write once the head is out and every segment has
    /// been taken.
    pub fn is_finished(&self) -> bool {
        self.head_sent && self.chunks.as_ref().is_none_or(ChunkSequence::is_exhausted)
    }

    /// Shallow copy of sequence, request and response, leaving the chunk
    /// sequence behind in the original.
    pub fn snapshot(&self) -> Pair {
        Pair {
            sequence: self.sequence,
            request: self.request.clone(),
            response: self.response.clone(),
            chunks: None,
            head_sent: self.head_sent,
        }
    }
}

impl PartialEq for Pair {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for Pair {}

impl PartialOrd for Pair {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pair {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence.cmp(&other.sequence)
    }
}
