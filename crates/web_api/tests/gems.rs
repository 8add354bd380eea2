use serde_json::{json, Value};
use web_api::gems::{
    create_call, delete_call, list_calls, parse_created_gem_id, parse_gem_list, update_call,
    RPC_CREATE_GEM, RPC_DELETE_GEM, RPC_LIST_GEMS, RPC_UPDATE_GEM,
};
use web_api::{WebApiError, WireGem};

#[test]
fn list_calls_request_system_then_custom() {
    let calls = list_calls(false);
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|call| call.rpc_id == RPC_LIST_GEMS));
    assert_eq!((calls[0].payload.as_str(), calls[0].identifier.as_str()), ("[3]", "system"));
    assert_eq!((calls[1].payload.as_str(), calls[1].identifier.as_str()), ("[2]", "custom"));

    assert_eq!(list_calls(true)[0].payload, "[4]");
}

#[test]
fn mutation_calls_encode_persona_fields() {
    let create = create_call("Tutor", "Explain slowly", "patient");
    assert_eq!(create.rpc_id, RPC_CREATE_GEM);
    let body: Value = serde_json::from_str(&create.payload).expect("payload JSON");
    assert_eq!(body[0][0], json!("Tutor"));
    assert_eq!(body[0][1], json!("patient"));
    assert_eq!(body[0][2], json!("Explain slowly"));

    let update = update_call("g1", "Tutor", "Explain", "");
    assert_eq!(update.rpc_id, RPC_UPDATE_GEM);
    let body: Value = serde_json::from_str(&update.payload).expect("payload JSON");
    assert_eq!(body[0], json!("g1"));
    assert_eq!(body[1][0], json!("Tutor"));

    let delete = delete_call("g1");
    assert_eq!(delete.rpc_id, RPC_DELETE_GEM);
    assert_eq!(delete.payload, r#"["g1"]"#);
}

#[test]
fn gem_list_payload_parses_entries() {
    let payload = json!([
        null,
        null,
        [
            ["g1", ["Tutor", "patient helper"], ["Explain slowly"]],
            ["g2", ["Bare"], null, "unknown trailing field"]
        ]
    ])
    .to_string();

    let gems = parse_gem_list(&payload, false).expect("gem list parses");
    assert_eq!(
        gems,
        vec![
            WireGem {
                id: "g1".to_owned(),
                name: "Tutor".to_owned(),
                description: Some("patient helper".to_owned()),
                prompt: Some("Explain slowly".to_owned()),
                predefined: false,
            },
            WireGem {
                id: "g2".to_owned(),
                name: "Bare".to_owned(),
                description: None,
                prompt: None,
                predefined: false,
            },
        ]
    );
}

#[test]
fn gem_list_without_list_slot_is_empty() {
    assert!(parse_gem_list("[]", true).expect("parses").is_empty());
}

#[test]
fn gem_entry_without_id_is_malformed() {
    let payload = json!([null, null, [[null, ["Nameless"]]]]).to_string();
    assert!(matches!(
        parse_gem_list(&payload, true),
        Err(WebApiError::MalformedFrames(_))
    ));
}

#[test]
fn created_gem_id_is_first_slot() {
    assert_eq!(parse_created_gem_id(r#"["g9", 1]"#).expect("id"), "g9");
    assert!(parse_created_gem_id("[]").is_err());
}
