// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use allspark_agent::config_sync::{ClientConfigPatch, VideoFormat};
use allspark_agent::error::{ProtocolError, TransportError};
use allspark_agent::protocol::*;
use allspark_agent::transport::Endpoint;
use serde_json::Value;
use std::time::Duration;

fn json_of(frame: Frame) -> Value {
    match frame {
        Frame::Text(text) => serde_json::from_str(&text).unwrap(),
        Frame::Binary(_) => panic!("expected a text frame"),
    }
}

#[test]
fn test_client_info_frame() {
    let frame = OutboundMessage::ClientInfo {
        client_name: "Lab (pi-3)".to_string(),
    }
    .to_frame()
    .unwrap();
    let value = json_of(frame);
    assert_eq!(value["type"], "clientInfo");
    assert_eq!(value["clientName"], "Lab (pi-3)");
}

#[test]
fn test_upload_frame() {
    let frame = OutboundMessage::Upload {
        filename: "cam01_front_1.mp4".to_string(),
        filesize: 1234,
        mimetype: "video/mp4".to_string(),
    }
    .to_frame()
    .unwrap();
    let value = json_of(frame);
    assert_eq!(value["type"], "upload");
    assert_eq!(value["filename"], "cam01_front_1.mp4");
    assert_eq!(value["filesize"], 1234);
    assert_eq!(value["mimetype"], "video/mp4");
}

#[test]
fn test_test_frame() {
    let value = json_of(OutboundMessage::Test.to_frame().unwrap());
    assert_eq!(value, serde_json::json!({ "type": "test" }));
}

#[test]
fn test_parse_client_config() {
    let parsed = parse_inbound(
        r#"{"type":"clientConfig","config":{"videoFormat":"mov","chunkDurationMs":15000,"storageMaxBytes":1048576}}"#,
    )
    .unwrap();
    assert_eq!(
        parsed,
        InboundMessage::ClientConfig(ClientConfigPatch {
            video_format: Some(VideoFormat::Mov),
            chunk_duration_ms: Some(15000),
            storage_max_bytes: Some(1_048_576),
        })
    );
}

#[test]
fn test_parse_client_config_without_payload() {
    let parsed = parse_inbound(r#"{"type":"clientConfig"}"#).unwrap();
    assert!(matches!(parsed, InboundMessage::Unrecognized(_)));
}

#[test]
fn test_parse_status() {
    let ok = parse_inbound(r#"{"status":"success","message":"stored"}"#).unwrap();
    assert_eq!(
        ok,
        InboundMessage::Status(CoordinatorStatus {
            success: true,
            message: "stored".to_string()
        })
    );

    let err = parse_inbound(r#"{"status":"error"}"#).unwrap();
    assert_eq!(
        err,
        InboundMessage::Status(CoordinatorStatus {
            success: false,
            message: String::new()
        })
    );

    let odd = parse_inbound(r#"{"status":"maybe"}"#).unwrap();
    assert!(matches!(odd, InboundMessage::Unrecognized(_)));
}

#[test]
fn test_parse_upload_time_range() {
    let parsed =
        parse_inbound(r#"{"command":"uploadTimeRange","startTime":1700000000000,"endTime":1700000060000.5}"#)
            .unwrap();
    assert_eq!(
        parsed,
        InboundMessage::Command(RemoteCommand::UploadTimeRange {
            start_ms: 1_700_000_000_000,
            end_ms: 1_700_000_060_000,
        })
    );

    let missing = parse_inbound(r#"{"command":"uploadTimeRange","startTime":1}"#).unwrap();
    assert!(matches!(missing, InboundMessage::Unrecognized(_)));
}

#[test]
fn test_parse_record_defaults_duration() {
    let parsed = parse_inbound(r#"{"command":"record"}"#).unwrap();
    assert_eq!(
        parsed,
        InboundMessage::Command(RemoteCommand::Record {
            duration: DEFAULT_RECORD_DURATION
        })
    );

    let parsed = parse_inbound(r#"{"command":"record","durationMs":5000}"#).unwrap();
    assert_eq!(
        parsed,
        InboundMessage::Command(RemoteCommand::Record {
            duration: Duration::from_secs(5)
        })
    );
}

#[test]
fn test_unknown_shapes_are_unrecognized() {
    for text in [
        r#"{"type":"hello"}"#,
        r#"{"command":"reboot"}"#,
        r#"{"foo":1}"#,
        r#"{}"#,
    ] {
        assert!(
            matches!(parse_inbound(text), Ok(InboundMessage::Unrecognized(_))),
            "{}",
            text
        );
    }
}

#[test]
fn test_malformed_frames_are_errors() {
    assert!(matches!(parse_inbound("{not json"), Err(ProtocolError::Json(_))));
    assert!(matches!(parse_inbound("[1,2]"), Err(ProtocolError::NotAnObject)));
    assert!(matches!(parse_inbound("\"text\""), Err(ProtocolError::NotAnObject)));
}

#[test]
fn test_endpoint_parsing() {
    let e = Endpoint::parse("https://coord.local:9443/").unwrap();
    assert_eq!((e.host.as_str(), e.port, e.secure), ("coord.local", 9443, true));
    assert_eq!(e.url(), "wss://coord.local:9443");
    assert_eq!(e.insecure().url(), "ws://coord.local:9443");

    let e = Endpoint::parse("WS://10.0.0.5").unwrap();
    assert_eq!(e.host, "10.0.0.5");
    assert_eq!(e.port, 8080);

    let e = Endpoint::parse("[fe80::1]:7000").unwrap();
    assert_eq!(e.host, "fe80::1");
    assert_eq!(e.authority(), "[fe80::1]:7000");

    assert!(matches!(
        Endpoint::parse("wss://"),
        Err(TransportError::InvalidEndpoint(_))
    ));
    assert!(matches!(
        Endpoint::parse("host:notaport"),
        Err(TransportError::InvalidEndpoint(_))
    ));
}

#[test]
fn test_fallback_classification() {
    assert!(TransportError::Refused("x".into()).permits_fallback());
    assert!(TransportError::Tls("bad cert".into()).permits_fallback());
    assert!(TransportError::Timeout(Duration::from_secs(1)).permits_fallback());
    assert!(!TransportError::InvalidEndpoint("x".into()).permits_fallback());
}
