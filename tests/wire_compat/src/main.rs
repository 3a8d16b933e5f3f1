fn main() {
    println!("Run `cargo test -p backhaul-wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use backhaul_protocol::{Command, ControlMessage, ProxyReply, ProxyRequest, SessionHeader};

    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn load_raw(name: &str) -> String {
        let path = fixtures_dir().join(name);
        fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()))
    }

    fn load_fixture(name: &str) -> serde_json::Value {
        serde_json::from_str(&load_raw(name))
            .unwrap_or_else(|e| panic!("failed to parse fixture {name}: {e}"))
    }

    /// Deserializes a fixture, re-serializes it, and compares the JSON
    /// values (key order independent).
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));
        assert_eq!(
            fixture, reserialized,
            "roundtrip mismatch for {name}:\n  wire: {fixture}\n  ours: {reserialized}"
        );
        parsed
    }

    // --- v1 control lines ---

    #[test]
    fn fixture_control_keep_alive() {
        let msg: ControlMessage = roundtrip_test("control_keep_alive.json");
        assert_eq!(msg, ControlMessage::keep_alive());
    }

    #[test]
    fn fixture_control_conn_ready() {
        let msg: ControlMessage = roundtrip_test("control_conn_ready.json");
        assert_eq!(msg.command, Command::ConnReady);
        assert!(msg.conn_path.starts_with("/ssh/revdial?dialer="));
        assert!(msg.err.is_empty());
    }

    #[test]
    fn fixture_control_pickup_failed() {
        let msg: ControlMessage = roundtrip_test("control_pickup_failed.json");
        assert_eq!(msg.command, Command::PickupFailed);
        assert_eq!(msg.err, "websocket: bad handshake");
    }

    #[test]
    fn fixture_control_lines_decode() {
        // Control lines arrive newline-terminated on the socket.
        for name in [
            "control_keep_alive.json",
            "control_conn_ready.json",
            "control_pickup_failed.json",
        ] {
            let line = load_raw(name);
            let msg = ControlMessage::decode(&line)
                .unwrap_or_else(|e| panic!("failed to decode {name}: {e}"));
            let encoded = msg.encode().unwrap();
            assert_eq!(encoded, line.trim(), "re-encoding changed {name}");
        }
    }

    #[test]
    fn fixture_control_unknown_command() {
        let msg = ControlMessage::decode(&load_raw("control_unknown_command.json")).unwrap();
        assert_eq!(msg.command, Command::Unknown);
    }

    // --- v2 stream headers ---

    #[test]
    fn fixture_session_header() {
        let header: SessionHeader = roundtrip_test("session_header.json");
        assert_eq!(header.id, "sess-7f3a");
    }

    #[test]
    fn fixture_proxy_request() {
        let req: ProxyRequest = roundtrip_test("proxy_request.json");
        assert_eq!(req.host, "10.0.0.5");
        assert_eq!(req.port, 8443);
    }

    #[test]
    fn fixture_proxy_reply_ok() {
        let reply: ProxyReply = roundtrip_test("proxy_reply_ok.json");
        assert!(reply.is_ok());
        assert_eq!(reply, ProxyReply::ok());
    }

    #[test]
    fn fixture_proxy_reply_failed() {
        let reply: ProxyReply = roundtrip_test("proxy_reply_failed.json");
        assert!(!reply.is_ok());
        assert!(reply.message.contains("connection refused"));
    }
}
