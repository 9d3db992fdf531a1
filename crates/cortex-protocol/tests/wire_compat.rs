// Verify the chat frame wire format stays stable for deployed clients.

use cortex_protocol::frames::{ClientFrame, CitedPassage, ServerFrame};
use uuid::Uuid;

#[test]
fn message_frame_round_trip() {
    let json = r#"{"type":"message","content":"How do I process returns?","department":"logistics"}"#;
    let frame: ClientFrame = serde_json::from_str(json).unwrap();

    match frame {
        ClientFrame::Message {
            content,
            department,
            language,
            attachments,
        } => {
            assert_eq!(content, "How do I process returns?");
            assert_eq!(department.as_deref(), Some("logistics"));
            assert!(language.is_none());
            assert!(attachments.is_none());
        }
        other => panic!("expected message frame, got {:?}", other),
    }
}

#[test]
fn message_frame_with_attachments() {
    let id = Uuid::new_v4();
    let json = format!(
        r#"{{"type":"message","content":"see attached","attachments":["{}"]}}"#,
        id
    );
    let frame: ClientFrame = serde_json::from_str(&json).unwrap();
    match frame {
        ClientFrame::Message { attachments, .. } => {
            assert_eq!(attachments.unwrap(), vec![id]);
        }
        other => panic!("expected message frame, got {:?}", other),
    }
}

#[test]
fn voice_frames_parse() {
    let start: ClientFrame = serde_json::from_str(r#"{"type":"voice_start"}"#).unwrap();
    assert!(matches!(start, ClientFrame::VoiceStart));

    let chunk: ClientFrame =
        serde_json::from_str(r#"{"type":"voice_chunk","data":"aGVsbG8="}"#).unwrap();
    match chunk {
        ClientFrame::VoiceChunk { data } => assert_eq!(data, "aGVsbG8="),
        other => panic!("expected voice_chunk, got {:?}", other),
    }

    let stop: ClientFrame = serde_json::from_str(r#"{"type":"voice_stop"}"#).unwrap();
    assert!(matches!(stop, ClientFrame::VoiceStop));
}

#[test]
fn cancel_frame_parses() {
    let frame: ClientFrame = serde_json::from_str(r#"{"type":"cancel"}"#).unwrap();
    assert!(matches!(frame, ClientFrame::Cancel));
}

#[test]
fn unknown_frame_type_is_rejected() {
    let result = serde_json::from_str::<ClientFrame>(r#"{"type":"shutdown"}"#);
    assert!(result.is_err());
}

#[test]
fn token_frame_serialization() {
    let json = serde_json::to_string(&ServerFrame::token("Hel")).unwrap();
    assert_eq!(json, r#"{"type":"token","text":"Hel"}"#);
}

#[test]
fn error_frame_serialization() {
    let json =
        serde_json::to_string(&ServerFrame::error("PROVIDER_UNAVAILABLE", "upstream down"))
            .unwrap();
    assert!(json.contains(r#""type":"error""#));
    assert!(json.contains(r#""code":"PROVIDER_UNAVAILABLE""#));
}

#[test]
fn done_frame_serialization() {
    let id = Uuid::new_v4();
    let json = serde_json::to_string(&ServerFrame::Done {
        query_id: id,
        elapsed_ms: 812,
    })
    .unwrap();
    assert!(json.contains(r#""type":"done""#));
    assert!(json.contains(&id.to_string()));
    assert!(json.contains(r#""elapsed_ms":812"#));
}

#[test]
fn citation_frame_omits_empty_fields() {
    let frame = ServerFrame::Citation {
        passages: vec![CitedPassage {
            id: Uuid::new_v4(),
            department: Some("it".into()),
            source_file: None,
            section_title: None,
            score: 0.87,
        }],
    };
    let json = serde_json::to_string(&frame).unwrap();
    assert!(json.contains(r#""department":"it""#));
    // absent optionals must not appear as null
    assert!(!json.contains("source_file"));
    assert!(!json.contains("null"));
}

#[test]
fn trace_frame_carries_arbitrary_data() {
    let frame = ServerFrame::trace("retrieve", serde_json::json!({"passages": 7, "degraded": false}));
    let json = serde_json::to_string(&frame).unwrap();
    assert!(json.contains(r#""step":"retrieve""#));
    assert!(json.contains(r#""passages":7"#));
}
