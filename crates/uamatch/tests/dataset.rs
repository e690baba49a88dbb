//! Dataset loading from files and bytes

mod common;

use common::*;
use std::io::Write;
use tempfile::NamedTempFile;
use uamatch::{validate_dataset, Dataset, LoadMode, MatchMethod, Provider, UamatchError};

fn write_dataset() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&dataset_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_find_profile_round_trip() {
    let dataset = memory_dataset();
    let ids = [
        HARDWARE_DEFAULT,
        HARDWARE_PHONE,
        HARDWARE_TABLET,
        HARDWARE_DESKTOP,
        SOFTWARE_DEFAULT,
        SOFTWARE_ANDROID,
        SOFTWARE_WINDOWS,
        BROWSER_DEFAULT,
        BROWSER_CHROME_32,
        BROWSER_CHROME_45,
        BROWSER_FIREFOX_60,
        BROWSER_CHROME_50,
    ];
    assert_eq!(dataset.profile_count(), ids.len());
    for id in ids {
        assert_eq!(dataset.find_profile(id).unwrap().unwrap().profile_id(), id);
    }
    for missing in [0, 999, 1004, 5000, u32::MAX] {
        assert!(dataset.find_profile(missing).unwrap().is_none());
    }
}

#[test]
fn test_metadata_comes_from_header() {
    let dataset = memory_dataset();
    assert_eq!(dataset.name(), "uamatch-test");
    assert_eq!(dataset.min_user_agent_length(), MIN_USER_AGENT_LENGTH);
    assert_eq!(dataset.max_signatures(), 10);
    assert_eq!(dataset.max_signatures_closest(), 10);
    assert_eq!(dataset.signature_count(), SIGNATURE_USER_AGENTS.len());

    let names: Vec<&str> = dataset.components().iter().map(|c| c.name()).collect();
    assert_eq!(names, vec!["HardwarePlatform", "SoftwarePlatform", "BrowserUA"]);
    assert_eq!(dataset.http_headers(), &["Device-Stock-UA".to_string(), "User-Agent".to_string()]);

    let features = dataset.find_property("Features").unwrap();
    assert!(features.is_list());
    assert_eq!(features.description(), Some("Hardware features the device offers"));
}

#[test]
fn test_signatures_sorted_and_ranked() {
    let dataset = memory_dataset();
    let mut previous: Option<Vec<u32>> = None;
    for index in 0..dataset.signature_count() as u32 {
        let signature = dataset.signature(index).unwrap();
        let offsets = signature.node_offsets().to_vec();
        if let Some(previous) = &previous {
            assert!(previous < &offsets);
        }
        assert_eq!(dataset.ranked_signature_index(signature.rank()), Some(index));
        previous = Some(offsets);
    }
}

#[test]
fn test_open_file_in_both_modes() {
    let file = write_dataset();
    for mode in [LoadMode::Memory, LoadMode::Stream] {
        let dataset = Dataset::from(file.path()).mode(mode).open().unwrap();
        assert_eq!(dataset.mode(), mode);

        let provider = Provider::builder(dataset).no_cache().build();
        for user_agent in SIGNATURE_USER_AGENTS {
            let result = provider.match_user_agent(user_agent).unwrap();
            assert_eq!(result.method(), MatchMethod::Exact, "{} ({})", user_agent, mode);
        }
        let result = provider
            .match_user_agent("Mozilla/5.0 (Linux; Android; Phone) Chrome/40")
            .unwrap();
        assert_eq!(result.method(), MatchMethod::Numeric);
    }
}

#[test]
fn test_stream_file_dispose_releases_readers() {
    let file = write_dataset();
    let dataset = Dataset::from(file.path())
        .mode(LoadMode::Stream)
        .max_readers(2)
        .open()
        .unwrap();
    dataset.find_profile(HARDWARE_PHONE).unwrap();
    assert!(dataset.readers_created() >= 1);

    dataset.dispose();
    assert_eq!(dataset.readers_created(), 0);
    assert!(matches!(dataset.find_profile(HARDWARE_PHONE), Err(UamatchError::Disposed)));
}

#[test]
fn test_missing_file() {
    let result = Dataset::from("/nonexistent/uamatch-test.dat").open();
    assert!(matches!(result, Err(UamatchError::Io(_))));
}

#[test]
fn test_built_dataset_validates() {
    let bytes = dataset_bytes();
    let report = validate_dataset(&bytes);
    assert!(report.is_valid(), "{:?}", report.errors);
    assert_eq!(report.stats.signature_count, 4);
    assert_eq!(report.stats.component_count, 3);
    assert_eq!(report.stats.profile_count, 12);
    // Shared substrings at the same position are one node
    assert_eq!(report.stats.complete_node_count, 9);
}

#[test]
fn test_truncated_dataset_is_rejected() {
    let bytes = dataset_bytes();
    let truncated = bytes[..bytes.len() / 2].to_vec();
    assert!(!validate_dataset(&truncated).is_valid());
    assert!(Dataset::from_bytes(truncated).is_err());
}
