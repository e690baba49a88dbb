//! Provider surfaces: headers, device ids, caching, threads and swapping

mod common;

use common::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use uamatch::{Match, MatchMethod, Provider, ProviderHandle};

fn profile_ids(result: &Match) -> Vec<u32> {
    result
        .profiles()
        .unwrap()
        .iter()
        .map(|p| p.profile_id())
        .collect()
}

#[test]
fn test_headers_merge_by_component_preference() {
    let provider = uncached_provider();
    let headers = [
        ("device-stock-ua", PHONE_CHROME_32),
        ("User-Agent", "Mozilla/5.0 (Linux; Android; Tablet) Chrome/40"),
        ("Accept-Language", "en-GB"),
    ];
    let result = provider.match_headers(headers).unwrap();

    // Hardware prefers the stock header; the rest only read User-Agent
    assert_eq!(
        profile_ids(&result),
        vec![HARDWARE_PHONE, SOFTWARE_ANDROID, BROWSER_CHROME_45]
    );
    // Worst method among the contributing headers
    assert_eq!(result.method(), MatchMethod::Numeric);
    assert_eq!(result.difference(), 5);
    assert!(result.signature().is_none());
    assert!(result.target_user_agent().is_none());
}

#[test]
fn test_unresolved_header_leaves_component_default() {
    let provider = uncached_provider();
    let headers = [
        ("Device-Stock-UA", WINDOWS_FIREFOX_60),
        ("User-Agent", "Opera/9.80 (J2ME/MIDP; Opera Mini)"),
    ];
    let result = provider.match_headers(headers).unwrap();
    assert_eq!(
        profile_ids(&result),
        vec![HARDWARE_DESKTOP, SOFTWARE_DEFAULT, BROWSER_DEFAULT]
    );
    assert_eq!(result.method(), MatchMethod::Exact);
}

#[test]
fn test_single_relevant_header_is_a_user_agent_match() {
    let provider = uncached_provider();
    let result = provider
        .match_headers([("user-agent", TABLET_CHROME_45), ("Accept", "*/*")])
        .unwrap();
    assert_eq!(result.method(), MatchMethod::Exact);
    assert_eq!(result.target_user_agent(), Some(TABLET_CHROME_45));
    assert_eq!(profile_ids(&result)[0], HARDWARE_TABLET);
}

#[test]
fn test_no_relevant_headers_gives_defaults() {
    let provider = uncached_provider();
    let result = provider.match_headers([("Accept", "*/*")]).unwrap();
    assert_eq!(result.method(), MatchMethod::None);
    assert_eq!(
        profile_ids(&result),
        vec![HARDWARE_DEFAULT, SOFTWARE_DEFAULT, BROWSER_DEFAULT]
    );
    let empty: [(&str, &str); 0] = [];
    assert_eq!(provider.match_headers(empty).unwrap().method(), MatchMethod::None);
}

#[test]
fn test_device_id_round_trip() {
    let provider = uncached_provider();
    for user_agent in SIGNATURE_USER_AGENTS.into_iter().chain(["", "Opera/9.80 (J2ME/MIDP; Opera Mini)"]) {
        let original = provider.match_user_agent(user_agent).unwrap();
        let expected = original.profile_ids().unwrap();

        let from_bytes = provider
            .match_for_device_id_bytes(&original.device_id_as_bytes().unwrap())
            .unwrap();
        assert_eq!(from_bytes.profile_ids().unwrap(), expected);

        let from_str = provider
            .match_for_device_id_str(&original.device_id().unwrap())
            .unwrap();
        assert_eq!(from_str.profile_ids().unwrap(), expected);
        assert_eq!(from_str.method(), MatchMethod::None);
        assert!(from_str.signature().is_none());
    }
}

#[test]
fn test_device_id_format() {
    let provider = uncached_provider();
    let result = provider.match_user_agent(PHONE_CHROME_32).unwrap();
    assert_eq!(result.device_id().unwrap(), "1001-2001-3001");

    let bytes = result.device_id_as_bytes().unwrap();
    assert_eq!(bytes.len(), 12);
    assert_eq!(&bytes[..4], &HARDWARE_PHONE.to_le_bytes());

    let ids = result.profile_ids().unwrap();
    assert_eq!(ids.get(&1), Some(&HARDWARE_PHONE));
    assert_eq!(ids.get(&3), Some(&BROWSER_CHROME_32));
}

#[test]
fn test_malformed_device_id_parts_are_skipped() {
    let provider = uncached_provider();

    let result = provider.match_for_device_id_str("1001-abc--3002-99999").unwrap();
    assert_eq!(
        profile_ids(&result),
        vec![HARDWARE_PHONE, SOFTWARE_DEFAULT, BROWSER_CHROME_45]
    );

    // Trailing partial id and an unknown id
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&SOFTWARE_WINDOWS.to_le_bytes());
    bytes.extend_from_slice(&7u32.to_le_bytes());
    bytes.extend_from_slice(&[1, 2]);
    let result = provider.match_for_device_id_bytes(&bytes).unwrap();
    assert_eq!(
        profile_ids(&result),
        vec![HARDWARE_DEFAULT, SOFTWARE_WINDOWS, BROWSER_DEFAULT]
    );

    // First profile for a component wins
    let result = provider
        .match_for_device_id_ids(&[HARDWARE_TABLET, HARDWARE_PHONE])
        .unwrap();
    assert_eq!(profile_ids(&result)[0], HARDWARE_TABLET);
}

#[test]
fn test_cache_serves_repeated_user_agents() {
    let provider = Provider::builder(memory_dataset())
        .user_agent_cache_capacity(16)
        .build();

    let first = provider.match_user_agent(PHONE_CHROME_32).unwrap();
    let second = provider.match_user_agent(PHONE_CHROME_32).unwrap();
    assert!(Arc::ptr_eq(first.result(), second.result()));

    let cache = provider.cache_stats().unwrap();
    assert_eq!(cache.requests, 2);
    assert_eq!(cache.misses, 1);

    let stats = provider.stats();
    assert_eq!(stats.detection_count, 2);
    assert_eq!(stats.method_count(MatchMethod::Exact), 2);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 1);
    assert!((stats.cache_hit_rate() - 0.5).abs() < f64::EPSILON);

    provider.reset_cache();
    assert_eq!(provider.cache_stats().unwrap().len, 0);
    provider.match_user_agent(PHONE_CHROME_32).unwrap();
    assert_eq!(provider.stats().cache_misses, 2);
}

#[test]
fn test_stats_count_each_public_call_once() {
    let provider = uncached_provider();
    assert!(provider.cache_stats().is_none());

    provider.match_user_agent(PHONE_CHROME_32).unwrap();
    provider.match_user_agent("").unwrap();
    provider
        .match_headers([
            ("Device-Stock-UA", PHONE_CHROME_32),
            ("User-Agent", "Mozilla/5.0 (Linux; Android; Phone) Chrome/40"),
        ])
        .unwrap();
    provider.match_for_device_id_str("1001").unwrap();

    let stats = provider.stats();
    assert_eq!(stats.detection_count, 4);
    assert_eq!(stats.method_count(MatchMethod::Exact), 1);
    assert_eq!(stats.method_count(MatchMethod::Numeric), 1);
    assert_eq!(stats.method_count(MatchMethod::None), 2);
    assert_eq!(stats.cache_hits + stats.cache_misses, 0);
}

#[test]
fn test_concurrent_matching_shares_one_provider() {
    let cases = [
        (PHONE_CHROME_32, MatchMethod::Exact, HARDWARE_PHONE),
        (TABLET_CHROME_45, MatchMethod::Exact, HARDWARE_TABLET),
        ("Mozilla/5.0 (Linux; Android; Phone) Chrome/40", MatchMethod::Numeric, HARDWARE_PHONE),
        ("Mozilla/5.0 (Linux; Android; Phonf) Chrome/32", MatchMethod::Closest, HARDWARE_PHONE),
        ("short", MatchMethod::None, HARDWARE_DEFAULT),
    ];
    for provider in [
        Provider::builder(memory_dataset()).user_agent_cache_capacity(4).build(),
        Provider::builder(stream_dataset()).no_cache().build(),
    ] {
        thread::scope(|s| {
            for t in 0..8 {
                let provider = &provider;
                s.spawn(move || {
                    for i in 0..50 {
                        let (user_agent, method, hardware) = cases[(t + i) % cases.len()];
                        let result = provider.match_user_agent(user_agent).unwrap();
                        assert_eq!(result.method(), method, "{}", user_agent);
                        assert_eq!(profile_ids(&result)[0], hardware);
                    }
                });
            }
        });
        assert_eq!(provider.stats().detection_count, 400);
    }
}

#[test]
fn test_handle_swap_and_drain() {
    let handle = ProviderHandle::new(uncached_provider());
    assert_eq!(handle.generation(), 1);

    let held = handle.current().match_user_agent(PHONE_CHROME_32).unwrap();
    let old_dataset = Arc::downgrade(handle.current().dataset());

    let retired = handle.swap(Provider::new(stream_dataset()));
    assert_eq!(handle.generation(), 2);
    assert!(!Arc::ptr_eq(&retired, &handle.current()));
    assert_eq!(handle.current().dataset().mode(), uamatch::LoadMode::Stream);

    // A live match keeps the old dataset in use
    let retired = handle
        .drain(retired, Duration::from_millis(20))
        .unwrap_err();
    assert!(!retired.dataset().is_disposed());
    assert_eq!(held.values("HardwareModel").unwrap().to_string(), "Phone");

    drop(held);
    handle.drain(retired, Duration::from_secs(5)).unwrap();
    assert!(old_dataset.upgrade().is_none());

    let result = handle.current().match_user_agent(PHONE_CHROME_32).unwrap();
    assert_eq!(result.method(), MatchMethod::Exact);
}

#[test]
fn test_drain_waits_for_provider_clones() {
    let handle = ProviderHandle::new(uncached_provider());
    let in_flight = handle.current();
    let retired = handle.swap(uncached_provider());

    let worker = thread::spawn(move || {
        let result = in_flight.match_user_agent(TABLET_CHROME_45).unwrap();
        thread::sleep(Duration::from_millis(30));
        result.method()
    });
    handle.drain(retired, Duration::from_secs(5)).unwrap();
    assert_eq!(worker.join().unwrap(), MatchMethod::Exact);
}
