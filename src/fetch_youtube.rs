//! YouTube transcript fetcher.
//!
//! Retrieves the watch page (optionally through the rotating proxy), digs the
//! player response JSON out of it, picks the best English caption track
//! (manual captions preferred over auto-generated), and fetches the track in
//! `json3` format as `{start, duration, text}` segments.
//!
//! Failure mapping follows the ingestion taxonomy: a video without caption
//! tracks is [`FetchError::TranscriptUnavailable`] (terminal), HTTP 429 is
//! [`FetchError::RateLimited`] (the controller pauses the source), and
//! connection problems retry with backoff before surfacing as
//! [`FetchError::Network`].

use regex::Regex;
use serde_json::Value;

use crate::config::{FetcherConfig, ProxyConfig};
use crate::error::FetchError;
use crate::fetch_web::{get_with_retries, http_client};
use crate::models::{TranscriptSegment, VideoInfo};

const DEFAULT_BASE: &str = "https://www.youtube.com";

/// Extract the 11-character video id from any of the usual URL shapes.
pub fn video_id_from_url(url: &str) -> Result<String, FetchError> {
    let patterns = [
        r"[?&]v=([A-Za-z0-9_-]{11})",
        r"youtu\.be/([A-Za-z0-9_-]{11})",
        r"/shorts/([A-Za-z0-9_-]{11})",
        r"/embed/([A-Za-z0-9_-]{11})",
    ];
    for pattern in patterns {
        if let Ok(re) = Regex::new(pattern) {
            if let Some(caps) = re.captures(url) {
                return Ok(caps[1].to_string());
            }
        }
    }
    Err(FetchError::Malformed(format!(
        "no video id found in url: {}",
        url
    )))
}

/// Fetch the transcript and video metadata for a watch URL.
pub async fn fetch_transcript(
    fetcher: &FetcherConfig,
    proxy: &ProxyConfig,
    video_url: &str,
) -> Result<(Vec<TranscriptSegment>, VideoInfo), FetchError> {
    let video_id = video_id_from_url(video_url)?;
    let base = fetcher.youtube_base.as_deref().unwrap_or(DEFAULT_BASE);
    let client = http_client(fetcher, proxy)?;

    let watch_url = format!("{}/watch?v={}", base.trim_end_matches('/'), video_id);
    let html = get_with_retries(&client, &watch_url, fetcher.max_retries).await?;

    let player = extract_player_response(&html).ok_or_else(|| {
        FetchError::Malformed(format!("no player response on watch page for {}", video_id))
    })?;

    check_playability(&player, &video_id)?;

    let track_url = select_caption_track(&player)
        .ok_or_else(|| FetchError::TranscriptUnavailable(video_id.clone()))?;
    let track_url = if track_url.contains("fmt=") {
        track_url
    } else {
        format!("{}&fmt=json3", track_url)
    };

    let body = get_with_retries(&client, &track_url, fetcher.max_retries).await?;
    let timed: Value = serde_json::from_str(&body)
        .map_err(|e| FetchError::Malformed(format!("caption track is not json3: {}", e)))?;

    let segments = parse_json3_events(&timed);
    if segments.is_empty() {
        return Err(FetchError::TranscriptUnavailable(video_id));
    }

    let info = parse_video_info(&player);
    Ok((segments, info))
}

/// Locate and parse `ytInitialPlayerResponse` in the watch-page HTML.
///
/// The assignment is found by regex; the JSON body is carved out by a
/// string-aware balanced-brace scan, since the page contains many more
/// braces after it.
pub fn extract_player_response(html: &str) -> Option<Value> {
    let re = Regex::new(r"ytInitialPlayerResponse\s*=\s*").ok()?;
    let m = re.find(html)?;
    let json = carve_json_object(&html[m.end()..])?;
    serde_json::from_str(json).ok()
}

/// Return the leading balanced `{...}` of the input, if any.
fn carve_json_object(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    if bytes.first() != Some(&b'{') {
        return None;
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn check_playability(player: &Value, video_id: &str) -> Result<(), FetchError> {
    let status = player
        .pointer("/playabilityStatus/status")
        .and_then(Value::as_str)
        .unwrap_or("OK");
    match status {
        "OK" => Ok(()),
        "ERROR" => Err(FetchError::NotFound(video_id.to_string())),
        "LOGIN_REQUIRED" => Err(FetchError::Forbidden(video_id.to_string())),
        other => Err(FetchError::Unavailable(format!(
            "{}: playability {}",
            video_id, other
        ))),
    }
}

/// Pick the caption track URL: manual English first, then auto-generated
/// English, then whatever exists.
fn select_caption_track(player: &Value) -> Option<String> {
    let tracks = player
        .pointer("/captions/playerCaptionsTracklistRenderer/captionTracks")?
        .as_array()?;
    if tracks.is_empty() {
        return None;
    }

    let is_english = |t: &Value| {
        t.get("languageCode")
            .and_then(Value::as_str)
            .map(|l| l.starts_with("en"))
            .unwrap_or(false)
    };
    let is_auto = |t: &Value| {
        t.get("kind").and_then(Value::as_str) == Some("asr")
    };

    let chosen = tracks
        .iter()
        .find(|t| is_english(t) && !is_auto(t))
        .or_else(|| tracks.iter().find(|t| is_english(t)))
        .or_else(|| tracks.first())?;

    chosen
        .get("baseUrl")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Map json3 caption events into transcript segments.
fn parse_json3_events(timed: &Value) -> Vec<TranscriptSegment> {
    let events = match timed.get("events").and_then(Value::as_array) {
        Some(e) => e,
        None => return Vec::new(),
    };

    let mut segments = Vec::new();
    for event in events {
        let segs = match event.get("segs").and_then(Value::as_array) {
            Some(s) => s,
            None => continue,
        };
        let text: String = segs
            .iter()
            .filter_map(|s| s.get("utf8").and_then(Value::as_str))
            .collect::<String>()
            .replace('\n', " ")
            .trim()
            .to_string();
        if text.is_empty() {
            continue;
        }

        let start_ms = event.get("tStartMs").and_then(Value::as_f64).unwrap_or(0.0);
        let duration_ms = event
            .get("dDurationMs")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        segments.push(TranscriptSegment {
            start: start_ms / 1000.0,
            duration: duration_ms / 1000.0,
            text,
        });
    }
    segments
}

fn parse_video_info(player: &Value) -> VideoInfo {
    let details = player.get("videoDetails");
    let title = details
        .and_then(|d| d.get("title"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let channel = details
        .and_then(|d| d.get("author"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let description = details
        .and_then(|d| d.get("shortDescription"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let duration_seconds = details
        .and_then(|d| d.get("lengthSeconds"))
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<f64>().ok());
    let publish_date = player
        .pointer("/microformat/playerMicroformatRenderer/publishDate")
        .and_then(Value::as_str)
        .map(str::to_string);

    VideoInfo {
        title,
        channel,
        publish_date,
        duration_seconds,
        description,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn test_video_id_from_url_shapes() {
        for url in [
            "https://www.youtube.com/watch?v=ABC123XYZ01",
            "https://www.youtube.com/watch?t=10&v=ABC123XYZ01",
            "https://youtu.be/ABC123XYZ01",
            "https://www.youtube.com/shorts/ABC123XYZ01",
            "https://www.youtube.com/embed/ABC123XYZ01?rel=0",
        ] {
            assert_eq!(video_id_from_url(url).unwrap(), "ABC123XYZ01", "{}", url);
        }
        assert!(video_id_from_url("https://example.com/").is_err());
    }

    #[test]
    fn test_carve_json_object_string_aware() {
        let s = r#"{"a": "brace } in string", "b": {"c": 1}} trailing"#;
        let carved = carve_json_object(s).unwrap();
        assert_eq!(carved, r#"{"a": "brace } in string", "b": {"c": 1}}"#);
        assert!(carve_json_object("not json").is_none());
        assert!(carve_json_object("{unterminated").is_none());
    }

    #[test]
    fn test_extract_player_response() {
        let html = r#"<script>var ytInitialPlayerResponse = {"videoDetails":{"title":"T"}};var other = {};</script>"#;
        let player = extract_player_response(html).unwrap();
        assert_eq!(player["videoDetails"]["title"], "T");
    }

    #[test]
    fn test_select_caption_track_prefers_manual_english() {
        let player = serde_json::json!({
            "captions": {"playerCaptionsTracklistRenderer": {"captionTracks": [
                {"baseUrl": "https://x/auto", "languageCode": "en", "kind": "asr"},
                {"baseUrl": "https://x/manual", "languageCode": "en"},
                {"baseUrl": "https://x/de", "languageCode": "de"}
            ]}}
        });
        assert_eq!(
            select_caption_track(&player).unwrap(),
            "https://x/manual"
        );
    }

    #[test]
    fn test_select_caption_track_none() {
        let player = serde_json::json!({"captions": {}});
        assert!(select_caption_track(&player).is_none());
    }

    #[test]
    fn test_parse_json3_events() {
        let timed = serde_json::json!({
            "events": [
                {"tStartMs": 0, "dDurationMs": 2000, "segs": [{"utf8": "hello "}, {"utf8": "world"}]},
                {"tStartMs": 2500, "dDurationMs": 1500, "segs": [{"utf8": "\n"}]},
                {"tStartMs": 4000, "dDurationMs": 1000, "segs": [{"utf8": "again"}]},
                {"tStartMs": 9999, "dDurationMs": 1, "aAppend": 1}
            ]
        });
        let segments = parse_json3_events(&timed);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "hello world");
        assert!((segments[0].start - 0.0).abs() < 1e-9);
        assert!((segments[1].start - 4.0).abs() < 1e-9);
        assert!((segments[1].duration - 1.0).abs() < 1e-9);
    }

    fn watch_page(caption_base: &str) -> String {
        format!(
            r#"<html><script>var ytInitialPlayerResponse = {{
                "playabilityStatus": {{"status": "OK"}},
                "videoDetails": {{"title": "Building a RAG pipeline", "author": "Some Channel",
                                  "lengthSeconds": "613", "shortDescription": "desc"}},
                "microformat": {{"playerMicroformatRenderer": {{"publishDate": "2026-01-05"}}}},
                "captions": {{"playerCaptionsTracklistRenderer": {{"captionTracks": [
                    {{"baseUrl": "{}", "languageCode": "en"}}
                ]}}}}
            }};</script></html>"#,
            caption_base
        )
    }

    fn fetcher(base: &str) -> FetcherConfig {
        FetcherConfig {
            timeout_secs: 5,
            max_retries: 0,
            youtube_base: Some(base.to_string()),
        }
    }

    #[tokio::test]
    async fn test_fetch_transcript_end_to_end() {
        let server = MockServer::start();
        let caption_url = format!("{}/api/timedtext?v=ABC123XYZ01", server.base_url());
        server.mock(|when, then| {
            when.method(GET).path("/watch");
            then.status(200).body(watch_page(&caption_url));
        });
        server.mock(|when, then| {
            when.method(GET).path("/api/timedtext");
            then.status(200).json_body(serde_json::json!({
                "events": [
                    {"tStartMs": 0, "dDurationMs": 3000, "segs": [{"utf8": "welcome back"}]},
                    {"tStartMs": 3000, "dDurationMs": 2000, "segs": [{"utf8": "to the channel"}]}
                ]
            }));
        });

        let (segments, info) = fetch_transcript(
            &fetcher(&server.base_url()),
            &ProxyConfig::default(),
            "https://www.youtube.com/watch?v=ABC123XYZ01",
        )
        .await
        .unwrap();

        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "welcome back");
        assert_eq!(info.title, "Building a RAG pipeline");
        assert_eq!(info.channel, "Some Channel");
        assert_eq!(info.duration_seconds, Some(613.0));
        assert_eq!(info.publish_date.as_deref(), Some("2026-01-05"));
    }

    #[tokio::test]
    async fn test_fetch_transcript_unavailable() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/watch");
            then.status(200).body(
                r#"<html><script>var ytInitialPlayerResponse = {
                    "playabilityStatus": {"status": "OK"},
                    "videoDetails": {"title": "No captions here", "author": "C"}
                };</script></html>"#,
            );
        });

        let err = fetch_transcript(
            &fetcher(&server.base_url()),
            &ProxyConfig::default(),
            "https://www.youtube.com/watch?v=ABC123XYZ01",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FetchError::TranscriptUnavailable(_)));
    }

    #[tokio::test]
    async fn test_fetch_transcript_rate_limited() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/watch");
            then.status(429);
        });

        let err = fetch_transcript(
            &fetcher(&server.base_url()),
            &ProxyConfig::default(),
            "https://www.youtube.com/watch?v=ABC123XYZ01",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FetchError::RateLimited));
    }
}
