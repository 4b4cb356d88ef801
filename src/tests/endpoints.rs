// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::VecDeque;

use proptest::prelude::*;

use super::*;
use crate::bdt::{bdt_index, Bank, Direction, Toggles, TxBankState, BDT_ENTRIES};
use crate::regs::Reg;
use crate::{PacketHandle, UsbError, NUM_USB_BUFFERS};

/// Free packets once the device is configured and every receive bank is
/// seeded.
const FREE_CONFIGURED: usize = NUM_USB_BUFFERS - RX_ARMED;

fn packet(usb: &mut Dev, data: &[u8]) -> PacketHandle {
    let mut p = usb.alloc().unwrap();
    usb.packet_mut(&mut p).fill(data);
    p
}

#[test]
fn tx_before_configuration_is_refused() {
    let mut usb = device(&CONFIG);
    let mut host = Host::new();
    host.reset(&mut usb);

    let p = packet(&mut usb, &[1, 2, 3]);
    assert_eq!(usb.free_packets(), NUM_USB_BUFFERS - 1);
    assert_eq!(usb.tx(EP_TX, p), Err(UsbError::NotConfigured));
    assert_eq!(usb.free_packets(), NUM_USB_BUFFERS);
    assert_eq!(host.in_token(&mut usb, EP_TX), Handshake::Nak);
}

#[test]
fn invalid_endpoints_are_refused() {
    let (mut usb, _host) = enumerated(&CONFIG);
    for ep in [0, NUM_ENDPOINTS + 1] {
        let p = packet(&mut usb, &[0xAA]);
        assert_eq!(usb.tx(ep, p), Err(UsbError::InvalidEndpoint));
        assert_eq!(usb.free_packets(), FREE_CONFIGURED);
        assert_eq!(usb.rx(ep), Err(UsbError::InvalidEndpoint));
        assert_eq!(usb.rx_byte_count(ep), Err(UsbError::InvalidEndpoint));
        assert_eq!(usb.tx_packet_count(ep), Err(UsbError::InvalidEndpoint));
    }
}

#[test]
fn transmit_fills_even_then_odd_then_queues() {
    let (mut usb, mut host) = enumerated(&CONFIG);
    let even = bdt_index(EP_TX, Direction::Tx, Bank::Even);
    let odd = bdt_index(EP_TX, Direction::Tx, Bank::Odd);

    let p = packet(&mut usb, &[1; 10]);
    usb.tx(EP_TX, p).unwrap();
    assert!(usb.bdt.entry(even).is_owned());
    assert!(!usb.bdt.entry(even).data1());
    assert!(!usb.bdt.entry(odd).is_owned());

    let p = packet(&mut usb, &[2; 20]);
    usb.tx(EP_TX, p).unwrap();
    assert!(usb.bdt.entry(odd).is_owned());
    assert!(usb.bdt.entry(odd).data1());
    assert_eq!(usb.tx_packet_count(EP_TX), Ok(0));

    let p = packet(&mut usb, &[3; 30]);
    usb.tx(EP_TX, p).unwrap();
    assert_eq!(usb.tx_packet_count(EP_TX), Ok(1));
    assert_eq!(usb.tx_byte_count(EP_TX), Ok(30));
    assert_eq!(usb.bdt.tx_state(EP_TX), TxBankState::NoneFreeEvenFirst);

    assert_eq!(host.in_token(&mut usb, EP_TX), Handshake::Data(vec![1; 10], false));
    assert_eq!(usb.tx_packet_count(EP_TX), Ok(0));
    assert_eq!(host.in_token(&mut usb, EP_TX), Handshake::Data(vec![2; 20], true));
    assert_eq!(host.in_token(&mut usb, EP_TX), Handshake::Data(vec![3; 30], false));
    assert_eq!(host.in_token(&mut usb, EP_TX), Handshake::Nak);

    assert_eq!(usb.free_packets(), FREE_CONFIGURED);
    assert_eq!(usb.bdt.tx_state(EP_TX), TxBankState::BothFreeOddFirst);

    // The next packet goes where the controller will look next.
    let p = packet(&mut usb, &[4; 4]);
    usb.tx(EP_TX, p).unwrap();
    assert!(usb.bdt.entry(odd).is_owned());
    assert_eq!(host.in_token(&mut usb, EP_TX), Handshake::Data(vec![4; 4], true));
}

#[test]
fn received_packets_are_queued_in_order() {
    let (mut usb, mut host) = enumerated(&CONFIG);

    assert_eq!(host.out(&mut usb, EP_RX, &[1; 10]), Handshake::Ack);
    assert_eq!(host.out(&mut usb, EP_RX, &[2; 64]), Handshake::Ack);
    // Zero-length packets carry nothing and aren't queued.
    assert_eq!(host.out(&mut usb, EP_RX, &[]), Handshake::Ack);

    assert_eq!(usb.rx_packet_count(EP_RX), Ok(2));
    assert_eq!(usb.rx_byte_count(EP_RX), Ok(74));
    assert_eq!(usb.free_packets(), FREE_CONFIGURED - 2);

    let p = usb.rx(EP_RX).unwrap().unwrap();
    assert_eq!(usb.packet(&p).data(), [1; 10]);
    usb.free(p);
    assert_eq!(usb.rx_byte_count(EP_RX), Ok(64));

    let p = usb.rx(EP_RX).unwrap().unwrap();
    assert_eq!(usb.packet(&p).data(), [2; 64]);
    usb.free(p);

    assert!(usb.rx(EP_RX).unwrap().is_none());
    assert_eq!(usb.rx_byte_count(EP_RX), Ok(0));
    assert_eq!(usb.free_packets(), FREE_CONFIGURED);

    // Nothing for a transmit-only endpoint.
    assert!(usb.rx(EP_TX).unwrap().is_none());
}

#[test]
fn bidirectional_endpoint() {
    let (mut usb, mut host) = enumerated(&CONFIG);
    let p = packet(&mut usb, b"ping");
    usb.tx(EP_BOTH, p).unwrap();
    assert_eq!(host.out(&mut usb, EP_BOTH, b"pong"), Handshake::Ack);
    assert_eq!(host.in_token(&mut usb, EP_BOTH).data().unwrap(), b"ping");
    let p = usb.rx(EP_BOTH).unwrap().unwrap();
    assert_eq!(usb.packet(&p).data(), b"pong");
    usb.free(p);
}

#[test]
fn send_copies_into_a_fresh_packet() {
    let (mut usb, mut host) = enumerated(&CONFIG);
    usb.send(EP_TX, b"hello").unwrap();
    assert_eq!(usb.free_packets(), FREE_CONFIGURED - 1);
    assert_eq!(host.in_token(&mut usb, EP_TX).data().unwrap(), b"hello");
    assert_eq!(usb.free_packets(), FREE_CONFIGURED);

    assert_eq!(usb.send(0, b"x"), Err(UsbError::InvalidEndpoint));

    let mut held = Vec::new();
    while let Some(p) = usb.alloc() {
        held.push(p);
    }
    assert_eq!(usb.send(EP_TX, b"x"), Err(UsbError::NoPacket));
    for p in held {
        usb.free(p);
    }
    assert_eq!(usb.free_packets(), FREE_CONFIGURED);
}

#[test]
fn send_before_configuration_is_refused() {
    let mut usb = device(&CONFIG);
    assert_eq!(usb.send(EP_TX, b"x"), Err(UsbError::NotConfigured));
    assert_eq!(usb.free_packets(), NUM_USB_BUFFERS);
}

#[test]
fn starved_receive_banks_get_freed_packets_first() {
    let (mut usb, mut host) = enumerated(&CONFIG);
    let even = bdt_index(EP_RX, Direction::Rx, Bank::Even);
    let odd = bdt_index(EP_RX, Direction::Rx, Bank::Odd);

    let mut held = Vec::new();
    while let Some(p) = usb.alloc() {
        held.push(p);
    }
    assert_eq!(held.len(), FREE_CONFIGURED);

    assert_eq!(host.out(&mut usb, EP_RX, &[1]), Handshake::Ack);
    assert_eq!(host.out(&mut usb, EP_RX, &[2]), Handshake::Ack);
    assert!(!usb.bdt.entry(even).is_owned());
    assert!(!usb.bdt.entry(odd).is_owned());
    // Nowhere to put a third.
    assert_eq!(host.out(&mut usb, EP_RX, &[3]), Handshake::Nak);

    usb.free(held.pop().unwrap());
    assert!(usb.bdt.entry(even).is_owned());
    assert_eq!(usb.free_packets(), 0);
    usb.free(held.pop().unwrap());
    assert!(usb.bdt.entry(odd).is_owned());
    assert_eq!(usb.free_packets(), 0);
    usb.free(held.pop().unwrap());
    assert_eq!(usb.free_packets(), 1);

    assert_eq!(host.out(&mut usb, EP_RX, &[3]), Handshake::Ack);
    for expected in [1, 2, 3] {
        let p = usb.rx(EP_RX).unwrap().unwrap();
        assert_eq!(usb.packet(&p).data(), [expected]);
        usb.free(p);
    }
    for p in held {
        usb.free(p);
    }
    assert_eq!(usb.free_packets(), FREE_CONFIGURED);
}

#[test]
fn configuration_starts_starved_when_pool_is_empty() {
    let (mut usb, mut host) = enumerated(&CONFIG);
    let mut held = Vec::new();
    while let Some(p) = usb.alloc() {
        held.push(p);
    }
    // Deconfiguring gives back only the seeded packets; take those too.
    assert!(host.control_out(&mut usb, set_configuration(0), &[]));
    assert_eq!(usb.free_packets(), RX_ARMED);
    while let Some(p) = usb.alloc() {
        held.push(p);
    }

    assert!(host.control_out(&mut usb, set_configuration(1), &[]));
    assert_eq!(usb.rx_memory_needed as usize, RX_ARMED);
    assert_eq!(host.out(&mut usb, EP_RX, &[9]), Handshake::Nak);

    for p in held {
        usb.free(p);
    }
    assert_eq!(usb.rx_memory_needed, 0);
    assert_eq!(usb.free_packets(), FREE_CONFIGURED);
    assert_eq!(host.out(&mut usb, EP_RX, &[9]), Handshake::Ack);
}

type Snapshot = (
    Vec<(u32, Option<u8>)>,
    Vec<TxBankState>,
    Vec<Toggles>,
    Vec<u8>,
    usize,
    u8,
);

/// Everything SET_CONFIGURATION is responsible for, for endpoints 1 and up.
fn snapshot(usb: &Dev) -> Snapshot {
    let first = bdt_index(1, Direction::Rx, Bank::Even);
    let bds = (first..BDT_ENTRIES)
        .map(|i| (usb.bdt.entry(i).desc(), usb.bdt.packet_slot(i)))
        .collect();
    let states = (1..=NUM_ENDPOINTS).map(|ep| usb.bdt.tx_state(ep)).collect();
    let toggles = (1..=NUM_ENDPOINTS).map(|ep| usb.bdt.toggles(ep)).collect();
    let endpt = (1..=NUM_ENDPOINTS)
        .map(|ep| usb.peripheral().get(Reg::Endpt(ep as u8)))
        .collect();
    (bds, states, toggles, endpt, usb.free_packets(), usb.rx_memory_needed)
}

#[test]
fn set_configuration_is_idempotent() {
    let (mut usb, mut host) = enumerated(&CONFIG);
    let once = snapshot(&usb);
    assert!(host.control_out(&mut usb, set_configuration(1), &[]));
    assert_eq!(snapshot(&usb), once);

    // Leave some traffic in flight, then ask twice more.
    let p = packet(&mut usb, &[5; 5]);
    usb.tx(EP_TX, p).unwrap();
    assert_eq!(host.out(&mut usb, EP_RX, &[6]), Handshake::Ack);
    assert!(host.control_out(&mut usb, set_configuration(1), &[]));
    let again = snapshot(&usb);
    assert!(usb.rx(EP_RX).unwrap().is_none());
    assert_eq!(again.1, once.1);
    assert_eq!(again.4, once.4);

    assert!(host.control_out(&mut usb, set_configuration(1), &[]));
    assert_eq!(snapshot(&usb), again);
}

#[test]
fn reconfiguration_keeps_bank_order_with_controller() {
    let (mut usb, mut host) = enumerated(&CONFIG);

    // Even goes out, odd is still pending when the host reconfigures.
    for b in [1u8, 2] {
        let p = packet(&mut usb, &[b]);
        usb.tx(EP_TX, p).unwrap();
    }
    assert_eq!(host.in_token(&mut usb, EP_TX), Handshake::Data(vec![1], false));
    assert_eq!(host.out(&mut usb, EP_RX, &[7]), Handshake::Ack);
    assert!(host.control_out(&mut usb, set_configuration(1), &[]));
    assert_eq!(host.in_token(&mut usb, EP_TX), Handshake::Nak);

    // The controller now uses the odd banks, and both toggles start over.
    let p = packet(&mut usb, &[3]);
    usb.tx(EP_TX, p).unwrap();
    assert!(usb.bdt.entry(bdt_index(EP_TX, Direction::Tx, Bank::Odd)).is_owned());
    assert_eq!(host.in_token(&mut usb, EP_TX), Handshake::Data(vec![3], false));
    let p = packet(&mut usb, &[4]);
    usb.tx(EP_TX, p).unwrap();
    assert_eq!(host.in_token(&mut usb, EP_TX), Handshake::Data(vec![4], true));

    assert!(!usb.bdt.entry(bdt_index(EP_RX, Direction::Rx, Bank::Odd)).data1());
    assert_eq!(host.out(&mut usb, EP_RX, &[8]), Handshake::Ack);
    assert_eq!(host.out(&mut usb, EP_RX, &[9]), Handshake::Ack);
    for expected in [8, 9] {
        let p = usb.rx(EP_RX).unwrap().unwrap();
        assert_eq!(usb.packet(&p).data(), [expected]);
        usb.free(p);
    }
    assert!(usb.rx(EP_RX).unwrap().is_none());
}

#[test]
fn clear_halt_restarts_in_toggle_at_data0() {
    let (mut usb, mut host) = enumerated(&CONFIG);
    usb.send(EP_TX, &[1]).unwrap();
    assert_eq!(host.in_token(&mut usb, EP_TX), Handshake::Data(vec![1], false));

    assert!(host.control_out(&mut usb, request(0x02, 0x03, 0, 0x82, 0), &[]));
    assert_eq!(host.in_token(&mut usb, EP_TX), Handshake::Stall);
    assert!(host.control_out(&mut usb, request(0x02, 0x01, 0, 0x82, 0), &[]));

    usb.send(EP_TX, &[2]).unwrap();
    assert_eq!(host.in_token(&mut usb, EP_TX), Handshake::Data(vec![2], false));
    usb.send(EP_TX, &[3]).unwrap();
    assert_eq!(host.in_token(&mut usb, EP_TX), Handshake::Data(vec![3], true));
}

#[test]
fn clear_halt_resends_armed_packets_in_order() {
    let (mut usb, mut host) = enumerated(&CONFIG);
    for b in 1u8..=4 {
        usb.send(EP_TX, &[b; 3]).unwrap();
    }
    assert_eq!(host.in_token(&mut usb, EP_TX), Handshake::Data(vec![1; 3], false));
    assert_eq!(usb.tx_packet_count(EP_TX), Ok(1));

    // 2 (odd, DATA1) and 3 (even, DATA0) are armed; 4 waits.
    assert!(host.control_out(&mut usb, request(0x02, 0x01, 0, 0x82, 0), &[]));
    assert_eq!(usb.tx_packet_count(EP_TX), Ok(1));
    assert_eq!(usb.tx_byte_count(EP_TX), Ok(3));

    let mut toggle = false;
    for b in 2u8..=4 {
        assert_eq!(host.in_token(&mut usb, EP_TX), Handshake::Data(vec![b; 3], toggle));
        toggle = !toggle;
    }
    assert_eq!(host.in_token(&mut usb, EP_TX), Handshake::Nak);
    assert_eq!(usb.free_packets(), FREE_CONFIGURED);
}

#[test]
fn clear_halt_restarts_out_toggle_at_data0() {
    let (mut usb, mut host) = enumerated(&CONFIG);
    assert_eq!(host.out(&mut usb, EP_RX, &[1]), Handshake::Ack);

    // The host starts over at DATA0 while the controller is on the odd bank.
    assert!(host.control_out(&mut usb, request(0x02, 0x01, 0, 0x01, 0), &[]));
    assert!(!usb.bdt.entry(bdt_index(EP_RX, Direction::Rx, Bank::Odd)).data1());
    assert!(usb.bdt.entry(bdt_index(EP_RX, Direction::Rx, Bank::Even)).data1());

    assert_eq!(host.out(&mut usb, EP_RX, &[2]), Handshake::Ack);
    assert_eq!(host.out(&mut usb, EP_RX, &[3]), Handshake::Ack);
    assert_eq!(usb.rx_packet_count(EP_RX), Ok(3));
    for expected in [1, 2, 3] {
        let p = usb.rx(EP_RX).unwrap().unwrap();
        assert_eq!(usb.packet(&p).data(), [expected]);
        usb.free(p);
    }
}

#[test]
fn deconfiguration_disables_endpoints() {
    let (mut usb, mut host) = enumerated(&CONFIG);
    assert_ne!(usb.peripheral().get(Reg::Endpt(EP_RX as u8)), 0);
    assert!(host.control_out(&mut usb, set_configuration(0), &[]));
    for ep in 1..=NUM_ENDPOINTS {
        assert_eq!(usb.peripheral().get(Reg::Endpt(ep as u8)), 0);
    }
    assert_eq!(usb.free_packets(), NUM_USB_BUFFERS);
    assert_eq!(host.out(&mut usb, EP_RX, &[1]), Handshake::Nak);
}

#[derive(Clone, Debug)]
enum Op {
    Tx(usize),
    In,
    Out(usize),
    Rx,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..=crate::PACKET_SIZE).prop_map(Op::Tx),
        Just(Op::In),
        (0..=crate::PACKET_SIZE).prop_map(Op::Out),
        Just(Op::Rx),
    ]
}

proptest! {
    #[test]
    fn endpoint_queues_match_model(ops in prop::collection::vec(op(), 1..80)) {
        let (mut usb, mut host) = enumerated(&CONFIG);
        let mut tx_model: VecDeque<usize> = VecDeque::new();
        let mut rx_model: VecDeque<usize> = VecDeque::new();
        let mut data1 = false;

        for (n, op) in ops.into_iter().enumerate() {
            match op {
                Op::Tx(len) => {
                    let Some(mut p) = usb.alloc() else { continue };
                    let fill = vec![n as u8; len];
                    usb.packet_mut(&mut p).fill(&fill);
                    usb.tx(EP_TX, p).unwrap();
                    tx_model.push_back(len);
                }
                Op::In => match tx_model.pop_front() {
                    Some(len) => {
                        match host.in_token(&mut usb, EP_TX) {
                            Handshake::Data(d, toggle) => {
                                prop_assert_eq!(d.len(), len);
                                prop_assert_eq!(toggle, data1);
                            }
                            other => prop_assert!(false, "expected data, got {:?}", other),
                        }
                        data1 = !data1;
                    }
                    None => prop_assert_eq!(host.in_token(&mut usb, EP_TX), Handshake::Nak),
                },
                Op::Out(len) => match host.out(&mut usb, EP_RX, &vec![n as u8; len]) {
                    // Zero-length packets are not queued.
                    Handshake::Ack => {
                        if len > 0 {
                            rx_model.push_back(len);
                        }
                    }
                    Handshake::Nak => prop_assert!(usb.rx_memory_needed > 0),
                    other => prop_assert!(false, "unexpected {:?}", other),
                },
                Op::Rx => match usb.rx(EP_RX).unwrap() {
                    Some(p) => {
                        prop_assert_eq!(Some(usb.packet(&p).data().len()), rx_model.pop_front());
                        usb.free(p);
                    }
                    None => prop_assert!(rx_model.is_empty()),
                },
            }

            // The two oldest packets sit in the banks; the rest wait in the queue.
            let queued: usize = tx_model.iter().skip(2).sum();
            prop_assert_eq!(usb.tx_byte_count(EP_TX), Ok(queued));
            prop_assert_eq!(usb.tx_packet_count(EP_TX), Ok(tx_model.len().saturating_sub(2)));
            prop_assert_eq!(usb.rx_byte_count(EP_RX), Ok(rx_model.iter().sum::<usize>()));
            prop_assert_eq!(usb.rx_packet_count(EP_RX), Ok(rx_model.len()));

            let armed_rx = RX_ARMED - usize::from(usb.rx_memory_needed);
            prop_assert_eq!(
                usb.free_packets() + tx_model.len() + rx_model.len() + armed_rx,
                NUM_USB_BUFFERS
            );
        }
    }
}
