mod common;

use common::{pattern, FakeCard};
use notecard::{BinaryStatus, Config};
use serde_json::json;

#[test]
fn transmit_into_empty_store_stages_once() {
    let fake = FakeCard::with_capacity(1024);
    let (card, _clock) = fake.open();
    let data = vec![0u8; 500];

    card.binary().transmit(&data, 0).unwrap();

    let state = fake.state();
    assert_eq!(state.payload_transmits, 1);
    assert_eq!(state.store, data);
    let puts = state.requests_named("card.binary.put");
    assert_eq!(puts.len(), 1);
    assert!(puts[0].get("offset").is_none());
    assert_eq!(puts[0]["status"], json!(notecard::binary::md5_hex(&data)));
}

#[test]
fn persistent_bad_bin_exhausts_staging_retries() {
    let fake = FakeCard::with_capacity(1024);
    let config = Config::default();
    let (card, _clock) = fake.open_with(config.clone());
    fake.state().corrupt_payloads = usize::MAX;

    let result = card.binary().transmit(&pattern(200), 0);
    assert!(matches!(result, Err(notecard::Error::BinaryTransmitFailed(_))));
    assert_eq!(
        fake.state().payload_transmits,
        config.binary_retries as usize + 1
    );
}

#[test]
fn transient_bad_bin_is_retried() {
    let fake = FakeCard::with_capacity(1024);
    let (card, _clock) = fake.open();
    fake.state().corrupt_payloads = 1;
    let data = pattern(300);

    card.binary().transmit(&data, 0).unwrap();

    let state = fake.state();
    assert_eq!(state.payload_transmits, 2);
    assert_eq!(state.store, data);
}

#[test]
fn appends_must_match_the_stored_length() {
    let fake = FakeCard::with_capacity(1024);
    let (card, _clock) = fake.open();
    let store = card.binary();
    store.transmit(&pattern(100), 0).unwrap();

    for offset in [0, 1, 99, 101, 500] {
        let result = store.transmit(&pattern(10), offset);
        assert!(
            matches!(result, Err(notecard::Error::Precondition(_))),
            "offset {} accepted",
            offset
        );
    }

    store.transmit(&pattern(50), 100).unwrap();
    let state = fake.state();
    assert_eq!(state.store.len(), 150);
    assert_eq!(state.payload_transmits, 2);
    assert_eq!(
        state.requests_named("card.binary.put")[1]["offset"],
        json!(100)
    );
}

#[test]
fn capacity_is_enforced_before_sending() {
    let fake = FakeCard::with_capacity(256);
    let (card, _clock) = fake.open();
    let store = card.binary();
    store.transmit(&pattern(200), 0).unwrap();

    let result = store.transmit(&pattern(57), 200);
    assert!(matches!(result, Err(notecard::Error::Precondition(_))));
    store.transmit(&pattern(56), 200).unwrap();
    assert_eq!(store.status().unwrap(), BinaryStatus { length: 256, max: 256 });
    assert_eq!(fake.state().payload_transmits, 2);
}

#[test]
fn zero_capacity_is_rejected() {
    let fake = FakeCard::with_capacity(0);
    let (card, _clock) = fake.open();

    let result = card.binary().transmit(b"x", 0);
    assert!(matches!(result, Err(notecard::Error::Precondition(_))));
    assert_eq!(fake.state().payload_transmits, 0);
}

#[test]
fn invalid_store_reads_as_empty_and_can_be_overwritten() {
    let fake = FakeCard::with_capacity(1024);
    let (card, _clock) = fake.open();
    {
        let mut state = fake.state();
        state.store = pattern(40);
        state.store_valid = false;
    }
    let store = card.binary();

    assert_eq!(store.length().unwrap(), 0);
    assert_eq!(store.status().unwrap().max, 1024);

    let data = pattern(64);
    store.transmit(&data, 0).unwrap();
    assert_eq!(fake.state().store, data);
}

#[test]
fn reset_clears_the_store() {
    let fake = FakeCard::with_capacity(1024);
    let (card, _clock) = fake.open();
    let store = card.binary();
    store.transmit(&pattern(10), 0).unwrap();

    store.reset().unwrap();
    assert_eq!(store.length().unwrap(), 0);
    let state = fake.state();
    let deletes = state
        .requests_named("card.binary")
        .into_iter()
        .filter(|request| request.contains_key("delete"))
        .count();
    assert_eq!(deletes, 1);
}

#[test]
fn receive_returns_verified_bytes() {
    let fake = FakeCard::with_capacity(1024);
    let (card, _clock) = fake.open();
    let data = pattern(600);
    let store = card.binary();
    store.transmit(&data, 0).unwrap();

    assert_eq!(store.receive(0, 600).unwrap(), data);
    assert_eq!(store.receive(100, 50).unwrap(), data[100..150].to_vec());
}

#[test]
fn interrupted_receive_requires_reset() {
    let fake = FakeCard::with_capacity(1024);
    let (card, _clock) = fake.open();
    let store = card.binary();
    store.transmit(&pattern(20), 0).unwrap();
    let baseline = fake.state().resets;
    fake.state().raw_receive_failures = 1;

    assert!(store.receive(0, 20).is_err());
    assert!(card.state().unwrap().reset_required);

    assert_eq!(store.receive(0, 20).unwrap(), pattern(20));
    assert_eq!(fake.state().resets, baseline + 1);
}
