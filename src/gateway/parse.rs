//! Decoding of controller statistics payloads.
//!
//! Payloads are walked as `serde_json::Value` rather than derived structs:
//! controllers disagree on whether counters are numbers or strings, and one
//! bad record must not take the rest of the reply down with it.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde_json::Value;

use crate::error::SchemaError;
use crate::fabric::{
    FlowCounterSample, FlowKey, FlowRecord, PortCounterSample, PortId, PortRecord, SwitchId,
};

/// Flow records decoded from one switch's reply.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlowBatch {
    pub records: Vec<FlowRecord>,
    /// Entries outside the statistics table or without a full TCP 4-tuple.
    pub skipped: usize,
    pub errors: Vec<SchemaError>,
}

/// Port records decoded from one switch's reply.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PortBatch {
    pub records: Vec<PortRecord>,
    pub errors: Vec<SchemaError>,
}

/// Connected switches from the controller's switch list.
pub fn parse_switches(body: &Value) -> Result<(Vec<SwitchId>, Vec<SchemaError>), String> {
    let entries = body
        .as_array()
        .ok_or_else(|| format!("expected switch array, got {}", type_name(body)))?;

    let mut switches = Vec::with_capacity(entries.len());
    let mut errors = Vec::new();

    for entry in entries {
        let dpid = entry
            .get("switchDPID")
            .or_else(|| entry.get("dpid"))
            .and_then(Value::as_str);

        match dpid {
            Some(d) if !d.is_empty() => switches.push(SwitchId::from(d)),
            _ => errors.push(SchemaError::MissingField {
                record: "switch",
                field: "switchDPID",
            }),
        }
    }

    Ok((switches, errors))
}

/// Flow entries from a single-switch reply. Accepts both the bare
/// `{"flows": [...]}` shape and one wrapped under the switch's dpid.
pub fn parse_flow_reply(
    body: &Value,
    switch: &SwitchId,
    stats_table: u8,
) -> Result<FlowBatch, String> {
    let scoped = switch_scope(body, switch, "flows")?;
    parse_flows(scoped, stats_table)
}

/// Port entries from a single-switch reply. Same shapes as
/// [`parse_flow_reply`].
pub fn parse_port_reply(body: &Value, switch: &SwitchId) -> Result<PortBatch, String> {
    let scoped = switch_scope(body, switch, "port_reply")?;
    parse_ports(scoped)
}

/// Split a bulk `{dpid: reply}` payload into per-switch replies.
pub fn split_bulk(body: &Value) -> Result<BTreeMap<SwitchId, &Value>, String> {
    let object = body
        .as_object()
        .ok_or_else(|| format!("expected object keyed by dpid, got {}", type_name(body)))?;

    Ok(object
        .iter()
        .map(|(dpid, reply)| (SwitchId::from(dpid.as_str()), reply))
        .collect())
}

/// Decode `{"flows": [...]}`.
pub fn parse_flows(reply: &Value, stats_table: u8) -> Result<FlowBatch, String> {
    let entries = reply
        .get("flows")
        .and_then(Value::as_array)
        .ok_or_else(|| "missing flows array".to_string())?;

    let mut batch = FlowBatch::default();

    for entry in entries {
        match parse_flow_entry(entry, stats_table) {
            Ok(Some(record)) => batch.records.push(record),
            Ok(None) => batch.skipped += 1,
            Err(e) => batch.errors.push(e),
        }
    }

    Ok(batch)
}

/// Decode `{"port_reply": [{"port": [...]}, ...]}`.
pub fn parse_ports(reply: &Value) -> Result<PortBatch, String> {
    let replies = reply
        .get("port_reply")
        .and_then(Value::as_array)
        .ok_or_else(|| "missing port_reply array".to_string())?;

    let mut batch = PortBatch::default();

    for part in replies {
        let Some(ports) = part.get("port").and_then(Value::as_array) else {
            batch.errors.push(SchemaError::MissingField {
                record: "port_reply",
                field: "port",
            });
            continue;
        };

        for entry in ports {
            match parse_port_entry(entry) {
                Ok(record) => batch.records.push(record),
                Err(e) => batch.errors.push(e),
            }
        }
    }

    Ok(batch)
}

fn parse_flow_entry(entry: &Value, stats_table: u8) -> Result<Option<FlowRecord>, SchemaError> {
    let table = entry.get("table_id").ok_or(SchemaError::MissingField {
        record: "flow",
        field: "table_id",
    })?;
    let table = parse_table_id(table).ok_or_else(|| invalid("flow", "table_id", table))?;

    if table != u64::from(stats_table) {
        return Ok(None);
    }

    let Some(m) = entry.get("match") else {
        return Ok(None);
    };

    let (Some(src), Some(dst), Some(sport), Some(dport)) = (
        m.get("ipv4_src"),
        m.get("ipv4_dst"),
        m.get("tcp_src"),
        m.get("tcp_dst"),
    ) else {
        return Ok(None);
    };

    let key = FlowKey {
        src_ip: parse_ipv4(src).ok_or_else(|| invalid("flow", "ipv4_src", src))?,
        dst_ip: parse_ipv4(dst).ok_or_else(|| invalid("flow", "ipv4_dst", dst))?,
        src_port: parse_u16(sport).ok_or_else(|| invalid("flow", "tcp_src", sport))?,
        dst_port: parse_u16(dport).ok_or_else(|| invalid("flow", "tcp_dst", dport))?,
    };

    let sample = FlowCounterSample {
        packet_count: counter(entry, "flow", "packet_count")?,
        byte_count: counter(entry, "flow", "byte_count")?,
    };

    Ok(Some(FlowRecord { key, sample }))
}

fn parse_port_entry(entry: &Value) -> Result<PortRecord, SchemaError> {
    let raw = entry.get("port_number").ok_or(SchemaError::MissingField {
        record: "port",
        field: "port_number",
    })?;

    let port = parse_u64(raw)
        .and_then(|n| PortId::try_from(n).ok())
        .ok_or_else(|| invalid("port", "port_number", raw))?;

    let sample = PortCounterSample {
        rx_packets: counter(entry, "port", "receive_packets")?,
        rx_bytes: counter(entry, "port", "receive_bytes")?,
        tx_packets: counter(entry, "port", "transmit_packets")?,
        tx_bytes: counter(entry, "port", "transmit_bytes")?,
    };

    Ok(PortRecord { port, sample })
}

fn switch_scope<'a>(body: &'a Value, switch: &SwitchId, field: &str) -> Result<&'a Value, String> {
    if body.get(field).is_some() {
        return Ok(body);
    }

    body.get(switch.as_str())
        .ok_or_else(|| format!("reply has neither {field} nor an entry for {switch}"))
}

fn counter(entry: &Value, record: &'static str, field: &'static str) -> Result<u64, SchemaError> {
    let raw = entry
        .get(field)
        .ok_or(SchemaError::MissingField { record, field })?;
    parse_u64(raw).ok_or_else(|| invalid(record, field, raw))
}

fn invalid(record: &'static str, field: &'static str, value: &Value) -> SchemaError {
    let value = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    SchemaError::InvalidField {
        record,
        field,
        value,
    }
}

/// Unsigned integer from a JSON number or a decimal string.
pub(crate) fn parse_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_u16(v: &Value) -> Option<u16> {
    parse_u64(v).and_then(|n| u16::try_from(n).ok())
}

/// Table id as `200`, `"200"` or `"0xc8"`.
pub(crate) fn parse_table_id(v: &Value) -> Option<u64> {
    if let Value::String(s) = v {
        let s = s.trim();
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            return u64::from_str_radix(hex, 16).ok();
        }
    }
    parse_u64(v)
}

fn parse_ipv4(v: &Value) -> Option<Ipv4Addr> {
    let s = v.as_str()?.trim();
    // Exact-match entries may carry a host mask.
    let s = s.strip_suffix("/32").unwrap_or(s);
    s.parse().ok()
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const STATS_TABLE: u8 = 0xc8;

    fn flow_entry(table: Value, tcp_dst: Option<&str>, bytes: &str) -> Value {
        let mut m = json!({
            "eth_type": "0x0x800",
            "ipv4_src": "10.10.1.1",
            "ipv4_dst": "10.10.2.1",
            "ip_proto": "0x6",
            "tcp_src": "5001",
        });
        if let Some(d) = tcp_dst {
            m["tcp_dst"] = json!(d);
        }
        json!({
            "version": "OF_13",
            "table_id": table,
            "packet_count": "12",
            "byte_count": bytes,
            "match": m,
        })
    }

    #[test]
    fn test_parse_switches() {
        let body = json!([
            {"switchDPID": "00:65:5c:8a:38:3e:cd:28", "inetAddress": "/10.0.0.1:6653"},
            {"dpid": "00:65:2c:23:3a:3e:ed:a9"},
            {"inetAddress": "/10.0.0.3:6653"},
        ]);
        let (switches, errors) = parse_switches(&body).expect("array");
        assert_eq!(switches.len(), 2);
        assert_eq!(switches[0].as_str(), "00:65:5c:8a:38:3e:cd:28");
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_parse_switches_not_array() {
        let err = parse_switches(&json!({"error": "x"})).expect_err("object");
        assert!(err.contains("expected switch array"));
    }

    #[test]
    fn test_flow_reply_stats_table_only() {
        let body = json!({"flows": [
            flow_entry(json!("0xc8"), Some("5002"), "1500"),
            flow_entry(json!("0x0"), Some("5002"), "99999"),
            flow_entry(json!(200), Some("5003"), "10"),
            flow_entry(json!("200"), Some("5004"), "20"),
        ]});
        let sw = SwitchId::from("s1");
        let batch = parse_flow_reply(&body, &sw, STATS_TABLE).expect("valid reply");

        assert_eq!(batch.records.len(), 3);
        assert_eq!(batch.skipped, 1);
        assert!(batch.errors.is_empty());

        let first = batch.records[0];
        assert_eq!(first.key.to_string(), "10.10.1.1:5001->10.10.2.1:5002");
        assert_eq!(first.sample.byte_count, 1500);
        assert_eq!(first.sample.packet_count, 12);
    }

    #[test]
    fn test_flow_missing_tcp_dst_is_excluded() {
        let body = json!({"flows": [
            flow_entry(json!("0xc8"), None, "1500"),
            flow_entry(json!("0xc8"), Some("5002"), "700"),
        ]});
        let batch = parse_flow_reply(&body, &SwitchId::from("s1"), STATS_TABLE).expect("valid");

        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].sample.byte_count, 700);
        assert_eq!(batch.skipped, 1);
        assert!(batch.errors.is_empty());
    }

    #[test]
    fn test_flow_bad_counter_is_schema_error() {
        let body = json!({"flows": [
            flow_entry(json!("0xc8"), Some("5002"), "lots"),
            flow_entry(json!("0xc8"), Some("5003"), "10"),
        ]});
        let batch = parse_flow_reply(&body, &SwitchId::from("s1"), STATS_TABLE).expect("valid");

        assert_eq!(batch.records.len(), 1);
        assert_eq!(
            batch.errors,
            vec![SchemaError::InvalidField {
                record: "flow",
                field: "byte_count",
                value: "lots".to_string(),
            }]
        );
    }

    #[test]
    fn test_flow_missing_table_id() {
        let mut entry = flow_entry(json!("0xc8"), Some("5002"), "1");
        entry
            .as_object_mut()
            .expect("object")
            .remove("table_id");
        let batch = parse_flows(&json!({"flows": [entry]}), STATS_TABLE).expect("valid");
        assert_eq!(batch.errors[0].kind(), "missing_field");
    }

    #[test]
    fn test_flow_reply_wrapped_by_dpid() {
        let sw = SwitchId::from("00:65:5c:8a:38:3e:cd:28");
        let body = json!({"00:65:5c:8a:38:3e:cd:28": {"flows": [
            flow_entry(json!("0xc8"), Some("5002"), "1"),
        ]}});
        let batch = parse_flow_reply(&body, &sw, STATS_TABLE).expect("wrapped reply");
        assert_eq!(batch.records.len(), 1);
    }

    #[test]
    fn test_flow_reply_malformed() {
        let err = parse_flow_reply(&json!({"foo": 1}), &SwitchId::from("s1"), STATS_TABLE)
            .expect_err("no flows");
        assert!(err.contains("neither flows"));
    }

    #[test]
    fn test_port_reply() {
        let body = json!({"port_reply": [{"version": "OF_13", "port": [
            {
                "port_number": "1",
                "receive_packets": "10",
                "transmit_packets": "20",
                "receive_bytes": "1000",
                "transmit_bytes": "2000",
            },
            {
                "port_number": "local",
                "receive_packets": "0",
                "transmit_packets": "0",
                "receive_bytes": "0",
                "transmit_bytes": "0",
            },
            {
                "port_number": 5,
                "receive_packets": 1,
                "transmit_packets": 2,
                "receive_bytes": 3,
                "transmit_bytes": 4,
            },
        ]}]});
        let batch = parse_port_reply(&body, &SwitchId::from("s1")).expect("valid reply");

        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.records[0].port, 1);
        assert_eq!(batch.records[0].sample.tx_bytes, 2000);
        assert_eq!(batch.records[1].port, 5);
        assert_eq!(batch.records[1].sample.rx_bytes, 3);
        assert_eq!(batch.errors.len(), 1);
        assert_eq!(batch.errors[0].kind(), "invalid_field");
    }

    #[test]
    fn test_port_missing_counter() {
        let body = json!({"port_reply": [{"port": [{"port_number": "1"}]}]});
        let batch = parse_ports(&body).expect("valid");
        assert!(batch.records.is_empty());
        assert_eq!(
            batch.errors,
            vec![SchemaError::MissingField {
                record: "port",
                field: "receive_packets",
            }]
        );
    }

    #[test]
    fn test_split_bulk() {
        let body = json!({
            "00:00:00:00:00:00:00:02": {"flows": []},
            "00:00:00:00:00:00:00:01": {"flows": []},
        });
        let parts = split_bulk(&body).expect("object");
        let ids: Vec<&str> = parts.keys().map(SwitchId::as_str).collect();
        assert_eq!(ids, vec!["00:00:00:00:00:00:00:01", "00:00:00:00:00:00:00:02"]);
        assert!(split_bulk(&json!([])).is_err());
    }

    #[test]
    fn test_parse_table_id() {
        assert_eq!(parse_table_id(&json!("0xc8")), Some(200));
        assert_eq!(parse_table_id(&json!("200")), Some(200));
        assert_eq!(parse_table_id(&json!(200)), Some(200));
        assert_eq!(parse_table_id(&json!("0xzz")), None);
        assert_eq!(parse_table_id(&json!(null)), None);
    }

    #[test]
    fn test_parse_ipv4_with_mask() {
        assert_eq!(
            parse_ipv4(&json!("10.10.1.1/32")),
            Some(Ipv4Addr::new(10, 10, 1, 1))
        );
        assert_eq!(parse_ipv4(&json!("10.10.1")), None);
        assert_eq!(parse_ipv4(&json!(1)), None);
    }

    #[test]
    fn test_parse_u64() {
        assert_eq!(parse_u64(&json!("18446744073709551615")), Some(u64::MAX));
        assert_eq!(parse_u64(&json!(-1)), None);
        assert_eq!(parse_u64(&json!(1.5)), None);
        assert_eq!(parse_u64(&json!(" 42 ")), Some(42));
    }
}
