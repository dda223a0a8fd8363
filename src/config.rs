// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Data structures and helper methods around influencing the configuration of the server.

use ini::Ini;
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Delay between the last mutation and the debounced snapshot save.
    pub save_debounce: Duration,
    /// Delay before an idle document is force-saved and evicted.
    pub cleanup_grace: Duration,
    /// Interval of the Mode-B background blob writer, per bucket.
    pub mode_b_interval: Duration,
    /// Number of most-recent log entries compaction retains.
    pub keep_window: u64,
    /// Compact the log every this many revisions; zero disables compaction.
    pub compact_interval: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            save_debounce: Duration::from_millis(1000),
            cleanup_grace: Duration::from_millis(30_000),
            mode_b_interval: Duration::from_millis(30_000),
            keep_window: 500,
            compact_interval: 500,
        }
    }
}

impl ServerConfig {
    pub fn from_config_file(config_file: &Path) -> Option<Self> {
        if !config_file.exists() {
            return None;
        }
        let conf = Ini::load_from_file(config_file)
            .expect("Could not access config file, even though it exists");
        let general_section = conf.general_section();
        let defaults = Self::default();

        let millis = |key: &str, fallback: Duration| {
            general_section.get(key).map_or(fallback, |value| {
                Duration::from_millis(
                    value
                        .parse()
                        .unwrap_or_else(|_| panic!("Failed to parse config parameter `{key}`")),
                )
            })
        };
        let count = |key: &str, fallback: u64| {
            general_section.get(key).map_or(fallback, |value| {
                value
                    .parse()
                    .unwrap_or_else(|_| panic!("Failed to parse config parameter `{key}`"))
            })
        };

        Some(Self {
            save_debounce: millis("save_debounce_ms", defaults.save_debounce),
            cleanup_grace: millis("cleanup_grace_ms", defaults.cleanup_grace),
            mode_b_interval: millis("mode_b_interval_ms", defaults.mode_b_interval),
            keep_window: count("keep_window", defaults.keep_window),
            compact_interval: count("compact_interval", defaults.compact_interval),
        })
    }
}
