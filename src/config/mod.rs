// Copyright © 2024 The Johns Hopkins Applied Physics Laboratory LLC.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Affero General Public License,
// version 3, as published by the Free Software Foundation.  If you
// would like to purchase a commercial license for this software, please
// contact APL’s Tech Transfer at 240-592-0817 or
// techtransfer@jhuapl.edu.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

//! Configuration objects.
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Configuration for the post-master core.
///
/// Every stream snapshots the values it needs at construction time;
/// changing the process environment afterwards does not affect live
/// streams.
///
/// # YAML Format
///
/// The YAML format has six fields, each of which has a default value:
///
/// - `timeout-resolution`: The granularity, in seconds, at which the
///   poller checks notification timeouts.  The default is `15`.
///
/// - `connection-window`: The number of seconds a single connect and
///   handshake attempt may take before it is timed out.  The default
///   is `120`.
///
/// - `connection-retry`: The maximum number of connection attempts in
///   one fault chain before the stream gives up.  The default is `5`.
///
/// - `stream-error-window`: The number of seconds after a terminal
///   fault during which new enqueues are rejected without attempting
///   to reconnect.  The default is `1800`.
///
/// - `multi-stream-count`: The target number of parallel sub-streams
///   to open per session.  The default is `0`, disabling multi-stream
///   operation.
///
/// - `multi-stream-split-size`: The default maximum chunk size, in
///   bytes, when splitting a large read across parallel sub-streams.
///   The default is `16777216` (16 MiB).
///
/// ## Examples
///
/// The following is an example of a YAML configuration with all
/// fields represented:
/// ```yaml
/// timeout-resolution: 15
/// connection-window: 120
/// connection-retry: 5
/// stream-error-window: 1800
/// multi-stream-count: 4
/// multi-stream-split-size: 16777216
/// ```
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
#[serde(rename = "post-master-config")]
#[serde(default)]
pub struct PostMasterConfig {
    #[serde(default = "PostMasterConfig::default_timeout_resolution")]
    timeout_resolution: u16,
    #[serde(default = "PostMasterConfig::default_connection_window")]
    connection_window: u32,
    #[serde(default = "PostMasterConfig::default_connection_retry")]
    connection_retry: u32,
    #[serde(default = "PostMasterConfig::default_stream_error_window")]
    stream_error_window: u32,
    #[serde(default = "PostMasterConfig::default_multi_stream_count")]
    multi_stream_count: u32,
    #[serde(default = "PostMasterConfig::default_multi_stream_split_size")]
    multi_stream_split_size: u64
}

static ENVIRONMENT: Mutex<Option<PostMasterConfig>> = Mutex::new(None);

/// Install `config` as the process-wide environment.
///
/// Streams created afterwards snapshot their values from it.
pub fn init(config: PostMasterConfig) {
    *ENVIRONMENT.lock().unwrap() = Some(config)
}

/// Tear the process-wide environment down.
pub fn teardown() {
    *ENVIRONMENT.lock().unwrap() = None
}

/// Get a snapshot of the process-wide environment.
///
/// If [init] has not been called, the defaults are returned.
pub fn current() -> PostMasterConfig {
    match &*ENVIRONMENT.lock().unwrap() {
        Some(config) => config.clone(),
        None => PostMasterConfig::default()
    }
}

impl PostMasterConfig {
    #[inline]
    fn default_timeout_resolution() -> u16 {
        15
    }

    #[inline]
    fn default_connection_window() -> u32 {
        120
    }

    #[inline]
    fn default_connection_retry() -> u32 {
        5
    }

    #[inline]
    fn default_stream_error_window() -> u32 {
        1800
    }

    #[inline]
    fn default_multi_stream_count() -> u32 {
        0
    }

    #[inline]
    fn default_multi_stream_split_size() -> u64 {
        16777216
    }

    /// Create a configuration from all values.
    #[inline]
    pub fn new(
        timeout_resolution: u16,
        connection_window: u32,
        connection_retry: u32,
        stream_error_window: u32,
        multi_stream_count: u32,
        multi_stream_split_size: u64
    ) -> Self {
        PostMasterConfig {
            timeout_resolution: timeout_resolution,
            connection_window: connection_window,
            connection_retry: connection_retry,
            stream_error_window: stream_error_window,
            multi_stream_count: multi_stream_count,
            multi_stream_split_size: multi_stream_split_size
        }
    }

    /// Get the poller timeout granularity in seconds.
    #[inline]
    pub fn timeout_resolution(&self) -> u16 {
        self.timeout_resolution
    }

    /// Get the time allowed for one connect and handshake attempt.
    #[inline]
    pub fn connection_window(&self) -> Duration {
        Duration::from_secs(self.connection_window as u64)
    }

    /// Get the maximum number of connection attempts per fault chain.
    #[inline]
    pub fn connection_retry(&self) -> u32 {
        self.connection_retry
    }

    /// Get the retry-suppression window after a terminal fault.
    #[inline]
    pub fn stream_error_window(&self) -> Duration {
        Duration::from_secs(self.stream_error_window as u64)
    }

    /// Get the target number of parallel sub-streams.
    #[inline]
    pub fn multi_stream_count(&self) -> u32 {
        self.multi_stream_count
    }

    /// Get the default read-split chunk size in bytes.
    #[inline]
    pub fn multi_stream_split_size(&self) -> u64 {
        self.multi_stream_split_size
    }
}

impl Default for PostMasterConfig {
    #[inline]
    fn default() -> Self {
        PostMasterConfig {
            timeout_resolution: Self::default_timeout_resolution(),
            connection_window: Self::default_connection_window(),
            connection_retry: Self::default_connection_retry(),
            stream_error_window: Self::default_stream_error_window(),
            multi_stream_count: Self::default_multi_stream_count(),
            multi_stream_split_size: Self::default_multi_stream_split_size()
        }
    }
}

#[test]
fn test_post_master_config_defaults() {
    let yaml = "{}\n";
    let expected = PostMasterConfig::default();
    let actual = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(expected, actual);
    assert_eq!(expected.connection_window(), Duration::from_secs(120));
    assert_eq!(expected.multi_stream_count(), 0);
}

#[test]
fn test_post_master_config_full() {
    let yaml = concat!(
        "timeout-resolution: 5\n",
        "connection-window: 30\n",
        "connection-retry: 3\n",
        "stream-error-window: 60\n",
        "multi-stream-count: 4\n",
        "multi-stream-split-size: 1048576\n",
    );
    let expected = PostMasterConfig::new(5, 30, 3, 60, 4, 1048576);
    let actual = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(expected, actual);
}

#[test]
fn test_post_master_config_partial() {
    let yaml = concat!("connection-retry: 2\n", "multi-stream-count: 2\n");
    let expected = PostMasterConfig::new(15, 120, 2, 1800, 2, 16777216);
    let actual = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(expected, actual);
}

#[test]
fn test_environment_snapshot() {
    teardown();
    assert_eq!(current(), PostMasterConfig::default());

    init(PostMasterConfig::new(5, 30, 3, 60, 2, 1048576));
    assert_eq!(current().connection_retry(), 3);
    assert_eq!(current().connection_window(), Duration::from_secs(30));

    teardown();
    assert_eq!(current(), PostMasterConfig::default());
}
