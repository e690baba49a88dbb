//! Shared test dataset
//!
//! Three components with a handful of profiles and four signatures sharing
//! the `Mozilla/5.0` and `Android` nodes. Hardware prefers the
//! `Device-Stock-UA` header over `User-Agent`; the other components only
//! look at `User-Agent`.

#![allow(dead_code)]

use uamatch::{Dataset, DatasetBuilder, LoadMode, Provider, ValueType};

pub const PHONE_CHROME_32: &str = "Mozilla/5.0 (Linux; Android; Phone) Chrome/32";
pub const TABLET_CHROME_45: &str = "Mozilla/5.0 (Linux; Android; Tablet) Chrome/45";
pub const WINDOWS_FIREFOX_60: &str = "Mozilla/5.0 (Windows NT) Firefox/60";
pub const PHONE_CHROME_50: &str = "Mozilla/5.0 (Linux; Android; Phone) Chrome/50";

/// Signature user agents in rank order
pub const SIGNATURE_USER_AGENTS: [&str; 4] = [
    PHONE_CHROME_32,
    TABLET_CHROME_45,
    WINDOWS_FIREFOX_60,
    PHONE_CHROME_50,
];

pub const MIN_USER_AGENT_LENGTH: usize = 10;

pub const HARDWARE_DEFAULT: u32 = 1000;
pub const HARDWARE_PHONE: u32 = 1001;
pub const HARDWARE_TABLET: u32 = 1002;
pub const HARDWARE_DESKTOP: u32 = 1003;
pub const SOFTWARE_DEFAULT: u32 = 2000;
pub const SOFTWARE_ANDROID: u32 = 2001;
pub const SOFTWARE_WINDOWS: u32 = 2002;
pub const BROWSER_DEFAULT: u32 = 3000;
pub const BROWSER_CHROME_32: u32 = 3001;
pub const BROWSER_CHROME_45: u32 = 3002;
pub const BROWSER_FIREFOX_60: u32 = 3003;
pub const BROWSER_CHROME_50: u32 = 3004;

pub fn dataset_bytes() -> Vec<u8> {
    let mut builder = DatasetBuilder::new("uamatch-test")
        .min_user_agent_length(MIN_USER_AGENT_LENGTH as u32)
        .max_signatures(10)
        .max_signatures_closest(10);

    let hardware = builder.add_component("HardwarePlatform", &["Device-Stock-UA", "User-Agent"]);
    let software = builder.add_component("SoftwarePlatform", &["User-Agent"]);
    let browser = builder.add_component("BrowserUA", &["User-Agent"]);

    let is_mobile = builder
        .add_property(hardware, "IsMobile", ValueType::Bool, Some("False"))
        .unwrap();
    let model = builder
        .add_property(hardware, "HardwareModel", ValueType::String, Some("Unknown"))
        .unwrap();
    let width = builder
        .add_property(hardware, "ScreenPixelsWidth", ValueType::Int, None)
        .unwrap();
    let ratio = builder
        .add_property(hardware, "PixelRatio", ValueType::Double, Some("1.0"))
        .unwrap();
    let features = builder
        .add_property_with(
            hardware,
            "Features",
            ValueType::String,
            true,
            None,
            Some("Hardware features the device offers"),
        )
        .unwrap();
    let platform = builder
        .add_property(software, "PlatformName", ValueType::String, Some("Unknown"))
        .unwrap();
    let browser_name = builder
        .add_property(browser, "BrowserName", ValueType::String, Some("Unknown"))
        .unwrap();
    let browser_version = builder
        .add_property(browser, "BrowserVersion", ValueType::String, None)
        .unwrap();

    builder.add_profile(hardware, HARDWARE_DEFAULT, &[]).unwrap();
    builder
        .add_profile(
            hardware,
            HARDWARE_PHONE,
            &[
                (is_mobile, "True"),
                (model, "Phone"),
                (width, "1080"),
                (ratio, "2.5"),
                (features, "Camera"),
                (features, "GPS"),
            ],
        )
        .unwrap();
    builder
        .add_profile(
            hardware,
            HARDWARE_TABLET,
            &[(is_mobile, "True"), (model, "Tablet"), (width, "2048")],
        )
        .unwrap();
    builder
        .add_profile(
            hardware,
            HARDWARE_DESKTOP,
            &[(is_mobile, "False"), (model, "Desktop"), (width, "1920")],
        )
        .unwrap();
    builder.set_default_profile(hardware, HARDWARE_DEFAULT).unwrap();

    builder.add_profile(software, SOFTWARE_DEFAULT, &[]).unwrap();
    builder
        .add_profile(software, SOFTWARE_ANDROID, &[(platform, "Android")])
        .unwrap();
    builder
        .add_profile(software, SOFTWARE_WINDOWS, &[(platform, "Windows")])
        .unwrap();
    builder.set_default_profile(software, SOFTWARE_DEFAULT).unwrap();

    builder.add_profile(browser, BROWSER_DEFAULT, &[]).unwrap();
    for (id, name, version) in [
        (BROWSER_CHROME_32, "Chrome", "32"),
        (BROWSER_CHROME_45, "Chrome", "45"),
        (BROWSER_FIREFOX_60, "Firefox", "60"),
        (BROWSER_CHROME_50, "Chrome", "50"),
    ] {
        builder
            .add_profile(browser, id, &[(browser_name, name), (browser_version, version)])
            .unwrap();
    }
    builder.set_default_profile(browser, BROWSER_DEFAULT).unwrap();

    builder
        .add_signature(
            PHONE_CHROME_32,
            &["Mozilla/5.0", "Android", "Phone", "Chrome/32"],
            &[HARDWARE_PHONE, SOFTWARE_ANDROID, BROWSER_CHROME_32],
        )
        .unwrap();
    builder
        .add_signature(
            TABLET_CHROME_45,
            &["Mozilla/5.0", "Android", "Tablet", "Chrome/45"],
            &[HARDWARE_TABLET, SOFTWARE_ANDROID, BROWSER_CHROME_45],
        )
        .unwrap();
    builder
        .add_signature(
            WINDOWS_FIREFOX_60,
            &["Mozilla/5.0", "Windows", "Firefox/60"],
            &[HARDWARE_DESKTOP, SOFTWARE_WINDOWS, BROWSER_FIREFOX_60],
        )
        .unwrap();
    builder
        .add_signature(
            PHONE_CHROME_50,
            &["Mozilla/5.0", "Android", "Phone", "Chrome/50"],
            &[HARDWARE_PHONE, SOFTWARE_ANDROID, BROWSER_CHROME_50],
        )
        .unwrap();

    builder.build().unwrap()
}

pub fn memory_dataset() -> Dataset {
    Dataset::from_bytes(dataset_bytes()).unwrap()
}

pub fn stream_dataset() -> Dataset {
    Dataset::from_bytes_builder(dataset_bytes())
        .mode(LoadMode::Stream)
        .cache_capacity(8)
        .max_readers(2)
        .open()
        .unwrap()
}

/// Provider without a User-Agent cache, so every call runs the matcher
pub fn uncached_provider() -> Provider {
    Provider::builder(memory_dataset()).no_cache().build()
}
