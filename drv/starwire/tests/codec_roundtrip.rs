// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Codec round-trip properties: any byte sequence survives encoding and
//! decoding unchanged, across any split of the line into epoch chunks.

use std::rc::Rc;

use drv_starwire::codec::{Decoder, DecoderSynch, Encoder, Symbol};
use duct::{Duct, DuctConfig, DuctPolarity};
use proptest::prelude::*;

fn line_duct(size: usize) -> Rc<Duct> {
    Rc::new(Duct::new(DuctConfig {
        label: "line",
        sender_replicas: 1,
        receiver_replicas: 1,
        max_flow: 1,
        message_size: size,
        polarity: DuctPolarity::SenderFirst,
    }))
}

/// Encodes `data` in one epoch and captures the raw line bytes.
fn encode_to_line(data: &[u8]) -> Vec<u8> {
    let duct = line_duct(data.len() * 2 + 16);
    let mut encoder = Encoder::new(Rc::clone(&duct), 0);
    encoder.prepare();
    if !data.is_empty() {
        assert_eq!(encoder.encode_data(data), data.len());
    }
    encoder.commit(0);

    let mut buf = vec![0u8; duct.message_size()];
    let mut txn = duct.receive_prepare(0);
    let n = txn.receive(&mut buf);
    txn.commit();
    buf.truncate(n);
    buf
}

/// Decodes line bytes delivered as the given chunks, one per epoch.
fn decode_chunks(chunks: &[&[u8]], capacity: usize) -> (Vec<u8>, Vec<Symbol>) {
    let largest = chunks.iter().map(|c| c.len()).max().unwrap_or(0);
    let duct = line_duct(largest.max(1));
    let mut decoder = Decoder::new(Rc::clone(&duct), 0);
    let mut synch = DecoderSynch::default();
    let mut data = Vec::new();
    let mut symbols = Vec::new();
    let mut buf = vec![0u8; capacity.max(1)];

    for chunk in chunks {
        let mut txn = duct.send_prepare(0);
        if !chunk.is_empty() {
            txn.send(chunk, 0);
        }
        txn.commit();

        decoder.prepare();
        while let Some(ent) = decoder.decode(&mut synch, Some(&mut buf)) {
            if let Some(symbol) = ent.ctrl {
                symbols.push(symbol);
            } else {
                data.extend_from_slice(&buf[..ent.data_len]);
            }
        }
        decoder.commit();
    }
    (data, symbols)
}

proptest! {
    /// decode(encode(B)) == B for any B and any chunking of the line.
    #[test]
    fn data_round_trips_across_any_chunking(
        data in prop::collection::vec(any::<u8>(), 0..300),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
    ) {
        let line = encode_to_line(&data);

        let mut boundaries: Vec<usize> =
            cuts.iter().map(|ndx| ndx.index(line.len() + 1)).collect();
        boundaries.push(0);
        boundaries.push(line.len());
        boundaries.sort_unstable();
        boundaries.dedup();

        let chunks: Vec<&[u8]> = boundaries
            .windows(2)
            .map(|w| &line[w[0]..w[1]])
            .collect();

        let (decoded, symbols) = decode_chunks(&chunks, data.len().max(1));
        prop_assert_eq!(decoded, data);
        prop_assert!(symbols.is_empty(), "no control characters synthesized");
    }

    /// Parameterized control characters survive arbitrary chunking too.
    #[test]
    fn controls_round_trip(params in prop::collection::vec(any::<u32>(), 1..10)) {
        let duct = line_duct(params.len() * 9 + 16);
        let mut encoder = Encoder::new(Rc::clone(&duct), 0);
        encoder.prepare();
        for &param in &params {
            assert!(encoder.encode_ctrl(Symbol::FlowControl, param));
        }
        encoder.commit(0);

        let mut line = vec![0u8; duct.message_size()];
        let mut txn = duct.receive_prepare(0);
        let n = txn.receive(&mut line);
        txn.commit();
        line.truncate(n);

        // byte-at-a-time is the worst-case chunking
        let chunks: Vec<&[u8]> = line.chunks(1).collect();
        let rx_duct = line_duct(4);
        let mut decoder = Decoder::new(Rc::clone(&rx_duct), 0);
        let mut synch = DecoderSynch::default();
        let mut seen = Vec::new();
        let mut buf = [0u8; 4];
        for chunk in chunks {
            let mut txn = rx_duct.send_prepare(0);
            txn.send(chunk, 0);
            txn.commit();
            decoder.prepare();
            while let Some(ent) = decoder.decode(&mut synch, Some(&mut buf)) {
                prop_assert_eq!(ent.ctrl, Some(Symbol::FlowControl));
                seen.push(ent.param);
            }
            decoder.commit();
        }
        prop_assert_eq!(seen, params);
    }
}
