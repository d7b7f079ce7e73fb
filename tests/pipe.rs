use std::fs::File;
use std::io::{Read, Write};

use stagerun::pipe::{StdinPipe, StdoutPipe};

#[test]
fn test_read_until_writer_is_gone() {
    let mut pipe = StdoutPipe::new();
    let write_end = pipe.create().unwrap();
    assert!(!pipe.closed());

    // nothing written yet, a non-finishing read just comes back empty
    assert!(pipe.read(false).unwrap().is_empty());
    assert!(!pipe.closed());

    let mut writer = File::from(write_end);
    writer.write_all(b"hello").unwrap();
    drop(writer);

    assert_eq!(pipe.read(false).unwrap(), b"hello");

    assert!(pipe.read(true).unwrap().is_empty());
    assert!(pipe.closed());

    // closed for good
    assert!(pipe.read(true).unwrap().is_empty());
    assert!(pipe.closed());
}

#[test]
fn test_finishing_read_still_returns_data() {
    let mut pipe = StdoutPipe::new();
    let mut writer = File::from(pipe.create().unwrap());

    writer.write_all(b"tail").unwrap();
    drop(writer);

    assert_eq!(pipe.read(true).unwrap(), b"tail");
    assert!(!pipe.closed());

    assert!(pipe.read(true).unwrap().is_empty());
    assert!(pipe.closed());
}

#[test]
fn test_close_discards_pending_data() {
    let mut pipe = StdoutPipe::new();
    let mut writer = File::from(pipe.create().unwrap());
    writer.write_all(b"ignored").unwrap();

    pipe.close();

    assert!(pipe.closed());
    assert!(pipe.read(false).unwrap().is_empty());
}

#[test]
fn test_stdin_pipe_delivers_bytes() {
    let mut pipe = StdinPipe::new();
    let mut reader = File::from(pipe.create().unwrap());

    assert!(pipe.is_open());
    assert_eq!(pipe.write(b"some input").unwrap(), 10);

    pipe.close();
    assert!(!pipe.is_open());

    let mut received = String::new();
    reader.read_to_string(&mut received).unwrap();
    assert_eq!(received, "some input");
}

#[test]
fn test_stdin_pipe_closes_when_reader_is_gone() {
    let mut pipe = StdinPipe::new();
    let reader = pipe.create().unwrap();
    drop(reader);

    assert_eq!(pipe.write(b"lost").unwrap(), 0);
    assert!(!pipe.is_open());

    // further writes are no-ops
    assert_eq!(pipe.write(b"lost").unwrap(), 0);
}

#[test]
fn test_stdin_pipe_full_writes_nothing_and_stays_open() {
    let mut pipe = StdinPipe::new();
    let reader = pipe.create().unwrap();

    let input = vec![b'x'; 1 << 20];

    let written = pipe.write(&input).unwrap();
    assert!(written > 0 && written < input.len());

    // nobody reads, the pipe stays full
    assert_eq!(pipe.write(&input[written..]).unwrap(), 0);
    assert!(pipe.is_open());

    drop(reader);
}
