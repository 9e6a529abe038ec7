//! Engine-over-IPC scenarios: a client peer drives the block cycle
//! through the named-pipe pair.

use ostinato::prelude::*;
use ostinato::{Backend as _, BlockContext, BlockData, IpcBackend};
use ostinato::io::AudioStream;
use std::sync::Arc;
use std::thread;

fn request(block_size: u32, sample_pos: u64) -> BlockData {
    BlockData {
        block_size,
        sample_pos,
        buffers: Vec::new(),
        messages: Vec::new(),
        perf_data: Vec::new(),
    }
}

fn sine_spec() -> Spec {
    let mut spec = Spec::new();
    spec.append_buffer("out_l", BufferKind::Audio).unwrap();
    spec.op_sine("out_l", 440.0).unwrap();
    spec.op_output("out_l", "left").unwrap();
    spec.op_end();
    spec
}

// The peer drives sample positions and receives one tagged buffer per
// written channel.
#[test]
fn test_ipc_block_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let address = dir.path().join("engine");

    let host = Arc::new(HostSystem::new(48_000, 256));
    let engine = Engine::new(host.clone());
    engine.set_spec(sine_spec()).unwrap();

    let mut backend = IpcBackend::new(&address);
    backend.setup(&host).unwrap();

    let client_thread = {
        let address = address.clone();
        thread::spawn(move || {
            let mut client = AudioStream::connect(&address).unwrap();
            client.send_block(&request(256, 0)).unwrap();
            let first = client.receive_block().unwrap();
            client.send_block(&request(256, 256)).unwrap();
            let second = client.receive_block().unwrap();
            (first, second)
        })
    };

    let mut ctxt = BlockContext::new(256);
    engine.process_block(&mut backend, &mut ctxt).unwrap();
    engine.process_block(&mut backend, &mut ctxt).unwrap();

    let (first, second) = client_thread.join().unwrap();
    backend.cleanup();

    assert_eq!(first.block_size, 256);
    assert_eq!(first.sample_pos, 0);
    assert_eq!(first.buffers.len(), 1);
    assert_eq!(first.buffers[0].id, "output:0");

    let samples = first.buffers[0].samples();
    assert_eq!(samples.len(), 256);
    for (n, sample) in samples.iter().enumerate() {
        let expected = (2.0 * std::f64::consts::PI * 440.0 * n as f64 / 48_000.0).sin() as f32;
        assert!((sample - expected).abs() < 1e-5);
    }

    // The second block continues from the peer's sample position.
    assert_eq!(second.sample_pos, 256);
    let expected = (2.0 * std::f64::consts::PI * 440.0 * 256.0 / 48_000.0).sin() as f32;
    assert!((second.buffers[0].samples()[0] - expected).abs() < 1e-5);
}

// A request with a different block size makes the backend reallocate its
// staging buffers and push the new size into the shared host config; the
// next program activation picks it up.
#[test]
fn test_ipc_block_size_change() {
    let dir = tempfile::tempdir().unwrap();
    let address = dir.path().join("engine");

    let host = Arc::new(HostSystem::new(48_000, 256));
    let engine = Engine::new(host.clone());
    engine.set_spec(sine_spec()).unwrap();

    let mut backend = IpcBackend::new(&address);
    backend.setup(&host).unwrap();

    let client_thread = {
        let address = address.clone();
        thread::spawn(move || {
            let mut client = AudioStream::connect(&address).unwrap();
            client.send_block(&request(256, 0)).unwrap();
            let first = client.receive_block().unwrap();
            client.send_block(&request(512, 256)).unwrap();
            let second = client.receive_block().unwrap();
            client.send_block(&request(512, 768)).unwrap();
            let third = client.receive_block().unwrap();
            (first, second, third)
        })
    };

    let mut ctxt = BlockContext::new(256);
    engine.process_block(&mut backend, &mut ctxt).unwrap();
    // Peer switches to 512 here.
    engine.process_block(&mut backend, &mut ctxt).unwrap();
    assert_eq!(host.block_size(), 512);

    // Rebuild the program at the new size; the evicted one is drained on
    // the control thread.
    engine.set_spec(sine_spec()).unwrap();
    engine.process_block(&mut backend, &mut ctxt).unwrap();
    engine.run_maintenance();

    let (first, second, third) = client_thread.join().unwrap();
    backend.cleanup();

    assert_eq!(first.block_size, 256);
    assert_eq!(first.buffers[0].samples().len(), 256);
    // The transition block is padded: the 256-sized program could only
    // fill the first half of the 512-sample staging buffer.
    assert_eq!(second.block_size, 512);
    let transition = second.buffers[0].samples();
    assert_eq!(transition.len(), 512);
    assert!(transition[300..].iter().all(|&s| s == 0.0));

    assert_eq!(third.block_size, 512);
    let samples = third.buffers[0].samples();
    assert_eq!(samples.len(), 512);
    // The 512-sized program rendered real data across the whole block.
    let expected = (2.0 * std::f64::consts::PI * 440.0 * (768.0 + 511.0) / 48_000.0).sin() as f32;
    assert!((samples[511] - expected).abs() < 1e-5);
}
