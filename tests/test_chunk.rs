use bytes::Bytes;
use tuplegate::http::chunk::{ChunkError, ChunkSequence};
use tuplegate::http::pair::Pair;
use tuplegate::http::request::{Method, RequestBuilder};
use tuplegate::http::response::ResponseBuilder;
use tuplegate::http::response::StatusCode;
use tuplegate::store::{Chunk, ChunkId};

fn chunk(id: u64, total_len: u64, data: &'static [u8], next: Option<u64>) -> Chunk {
    Chunk {
        id: ChunkId(id),
        total_len,
        content_type: None,
        data: Bytes::from_static(data),
        next: next.map(ChunkId),
    }
}

#[test]
fn test_sequence_length_rounds_up() {
    assert_eq!(ChunkSequence::new(chunk(1, 10, b"0123", Some(2)), 4).len(), 3);
    assert_eq!(ChunkSequence::new(chunk(1, 8, b"0123", Some(2)), 4).len(), 2);
    assert_eq!(ChunkSequence::new(chunk(1, 0, b"", None), 4).len(), 1);
}

#[test]
fn test_next_chunk_never_skips_ahead() {
    let mut seq = ChunkSequence::new(chunk(1, 10, b"0123", Some(2)), 4);
    assert!(seq.is_chunk_head());

    let head = seq.next_chunk().unwrap().unwrap();
    assert_eq!(head.id, ChunkId(1));
    assert!(!seq.is_chunk_head());

    // second segment has not arrived
    assert_eq!(seq.next_chunk(), Ok(None));
    assert!(!seq.has_ready());

    seq.set_chunk(chunk(2, 10, b"4567", Some(3))).unwrap();
    assert!(seq.has_ready());
    assert_eq!(seq.next_chunk().unwrap().unwrap().id, ChunkId(2));

    seq.set_chunk(chunk(3, 10, b"89", None)).unwrap();
    assert_eq!(seq.next_chunk().unwrap().unwrap().id, ChunkId(3));

    assert!(seq.is_exhausted());
    assert_eq!(seq.next_chunk(), Err(ChunkError::Exhausted));
}

#[test]
fn test_set_chunk_past_declared_count_overflows() {
    let mut seq = ChunkSequence::new(chunk(1, 8, b"0123", Some(2)), 4);
    seq.set_chunk(chunk(2, 8, b"4567", None)).unwrap();

    let result = seq.set_chunk(chunk(3, 8, b"extra", None));

    assert_eq!(result, Err(ChunkError::Overflow { expected: 2 }));
}

#[test]
fn test_pair_builds_sequence_only_for_segmented_get() {
    let head = chunk(1, 10, b"0123", Some(2));

    let get = RequestBuilder::new().method(Method::GET).path("/big").build().unwrap();
    let mut pair = Pair::new(get);
    pair.set_http_response(ResponseBuilder::new(StatusCode::Ok).chunked(head.clone()).build(), 4);
    assert_eq!(pair.chunks().map(ChunkSequence::len), Some(3));

    let head_req = RequestBuilder::new().method(Method::HEAD).path("/big").build().unwrap();
    let mut pair = Pair::new(head_req);
    pair.set_http_response(ResponseBuilder::new(StatusCode::Ok).chunked(head).build(), 4);
    assert!(pair.chunks().is_none());

    let get = RequestBuilder::new().method(Method::GET).path("/small").build().unwrap();
    let mut pair = Pair::new(get);
    pair.set_http_response(ResponseBuilder::new(StatusCode::Ok).body("small").build(), 4);
    assert!(pair.chunks().is_none());
}

#[test]
fn test_pair_finishes_after_head_and_every_segment() {
    let get = RequestBuilder::new().method(Method::GET).path("/big").build().unwrap();
    let mut pair = Pair::new(get);
    pair.set_http_response(
        ResponseBuilder::new(StatusCode::Ok)
            .chunked(chunk(1, 8, b"0123", Some(2)))
            .build(),
        4,
    );

    assert!(!pair.is_finished());
    pair.chunks_mut().unwrap().next_chunk().unwrap();
    pair.mark_head_sent();
    assert!(!pair.is_finished());

    let chunks = pair.chunks_mut().unwrap();
    chunks.set_chunk(chunk(2, 8, b"4567", None)).unwrap();
    chunks.next_chunk().unwrap();
    assert!(pair.is_finished());
}

#[test]
fn test_pairs_order_by_sequence() {
    let mut requests: Vec<Pair> = [3u64, 1, 2]
        .into_iter()
        .map(|sequence| {
            let mut request = RequestBuilder::new().method(Method::GET).path("/").build().unwrap();
            request.sequence = sequence;
            Pair::new(request)
        })
        .collect();
    requests.sort();

    let order: Vec<u64> = requests.iter().map(Pair::sequence).collect();
    assert_eq!(order, vec![1, 2, 3]);

    let snapshot = requests[0].snapshot();
    assert_eq!(snapshot, requests[0]);
    assert!(snapshot.chunks().is_none());
}
