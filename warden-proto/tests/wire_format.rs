//! Wire-format tests
//!
//! These frames are what existing clients send and expect, so field names,
//! integer enum values and the `Idx` echo are checked against literal JSON.

use serde_json::{json, Value};
use warden_proto::codec::{decode_request, decode_response, encode_response};
use warden_proto::request::{Request, SessionNew};
use warden_proto::response::{
    ConnectedResp, DisconnectedResp, HelloResp, KillSwitchStatusResp, SessionNewResp, SessionResp,
};
use warden_proto::{AccountStatus, DisconnectReason, Error, Response, VpnType};

fn encode(resp: &Response, idx: i64) -> Value {
    let line = encode_response(resp, idx).unwrap();
    assert!(line.ends_with('\n'));
    assert_eq!(line.matches('\n').count(), 1, "frame must be one line");
    serde_json::from_str(line.trim_end()).unwrap()
}

#[test]
fn test_session_new_frame() {
    let line = r#"{"Command":"SessionNew","Idx":12,"ProtocolSecret":"",
        "AccountID":"i-AAAA-BBBB-CCCC","ForceLogin":false,"SomeFutureField":1}"#
        .replace('\n', "");
    let (header, request) = decode_request(&line).unwrap();
    assert_eq!(header.command, "SessionNew");
    assert_eq!(header.idx, 12);
    assert_eq!(
        request,
        Request::SessionNew(SessionNew {
            account_id: "i-AAAA-BBBB-CCCC".into(),
            ..Default::default()
        })
    );
}

#[test]
fn test_session_new_resp_limit() {
    let resp = Response::SessionNewResp(SessionNewResp {
        api_status: 602,
        api_error_message: "Session limit".into(),
        session: SessionResp::default(),
        account: AccountStatus {
            active: true,
            limit: 5,
            ..Default::default()
        },
        raw_response: String::new(),
    });
    let value = encode(&resp, 12);
    assert_eq!(value["Command"], "SessionNewResp");
    assert_eq!(value["Idx"], 12);
    assert_eq!(value["APIStatus"], 602);
    assert_eq!(value["APIErrorMessage"], "Session limit");
    assert_eq!(value["Session"]["Session"], "");
    assert_eq!(value["Account"]["Limit"], 5);
    assert_eq!(value["Account"]["Active"], true);
}

#[test]
fn test_connected_broadcast() {
    let resp = Response::ConnectedResp(ConnectedResp {
        vpn_type: VpnType::WTunnel,
        client_ip: "10.0.0.2".into(),
        server_ip: "185.1.1.1".into(),
        server_port: 2049,
        is_can_pause: true,
        ..Default::default()
    });
    let value = encode(&resp, 0);
    assert_eq!(value["Idx"], 0);
    assert_eq!(value["VpnType"], 1);
    assert_eq!(value["ClientIP"], "10.0.0.2");
    assert_eq!(value["IsPaused"], false);
    assert_eq!(value["ServerPort"], 2049);
}

#[test]
fn test_disconnected_reason_is_integer() {
    let resp = Response::DisconnectedResp(DisconnectedResp {
        failure: false,
        reason: DisconnectReason::DisconnectRequested,
        reason_description: String::new(),
    });
    let value = encode(&resp, 3);
    assert_eq!(value["Reason"], 2);
    assert_eq!(value["Failure"], false);
}

#[test]
fn test_kill_switch_status_names() {
    let resp = Response::KillSwitchStatusResp(KillSwitchStatusResp {
        is_enabled: true,
        is_allow_lan: true,
        is_allow_api_servers: true,
        ..Default::default()
    });
    let value = encode(&resp, 4);
    for key in [
        "IsEnabled",
        "IsPersistent",
        "IsAllowLAN",
        "IsAllowMulticast",
        "IsAllowApiServers",
        "UserExceptions",
    ] {
        assert!(value.get(key).is_some(), "missing {key}");
    }
}

#[test]
fn test_hello_resp_shape() {
    let value = encode(&Response::HelloResp(HelloResp::default()), 1);
    assert_eq!(value["Command"], "HelloResp");
    assert_eq!(value["ParanoidMode"], json!({"IsEnabled": false}));
    assert!(value["Dns"].get("CanUseDnsOverHttps").is_some());
    assert!(value["DaemonSettings"].get("IsAutoconnectOnLaunchDaemon").is_some());
    assert!(value.get("SettingsSessionUUID").is_some());
}

#[test]
fn test_client_side_decode_ignores_idx() {
    let line = r#"{"Command":"ErrorResp","Idx":8,"ErrorMessage":"not logged in","ErrorType":0}"#;
    let (idx, resp) = decode_response(line).unwrap();
    assert_eq!(idx, 8);
    match resp {
        Response::ErrorResp(err) => assert_eq!(err.error_message, "not logged in"),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_every_known_command_has_a_variant() {
    for command in Request::COMMANDS {
        let line = json!({ "Command": command, "Idx": 1 }).to_string();
        match decode_request(&line) {
            Ok((_, request)) => assert_eq!(request.command(), *command),
            Err(Error::InvalidMessage(msg)) => panic!("{command}: {msg}"),
            Err(other) => panic!("{command}: {other}"),
        }
    }
}
