// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! JSON-RPC control plane for the executive, over line-delimited frames.
//!
//! Requests are `{version, cmd, args, seq}`, responses `{seq, ok,
//! result|error}`, and events `{event, seq, body}`. Unknown request
//! fields are ignored, which is the forward-compatibility contract:
//! newer debuggers may send more than this build understands.
//!
//! The layer is transport-agnostic: [`serve`] drives any `BufRead` +
//! `Write` pair (stdio for the CLI, a TCP stream for remote attach).
//! Sessions are stateful; every request refreshes the keepalive, and the
//! event stream is interleaved after each response once the client has
//! subscribed.

use std::io::{BufRead, Write};

use hsx_abi::{AuthLevel, Oid, Pid};
use hsx_kern::Executive;
use hsx_vm::RegSel;
use serde::Deserialize;
use serde_json::{json, Value};

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default = "default_version")]
    pub version: u32,
    pub cmd: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub seq: u64,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

/// Handler-internal error carrying the wire code.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RpcError {
    pub code: &'static str,
    pub message: String,
}

impl RpcError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        RpcError { code, message: message.into() }
    }
}

impl From<hsx_kern::ExecError> for RpcError {
    fn from(e: hsx_kern::ExecError) -> Self {
        use hsx_kern::ExecError;
        let code = match &e {
            ExecError::Load(_) => "EIMAGE",
            ExecError::NoSuchTask(_) => "ENOENT",
            ExecError::SessionBusy => "EPERM",
            ExecError::NoSession => "ESESSION",
            ExecError::NotStopped => "EBUSY",
            ExecError::TooManyTasks | ExecError::InstanceExists(_) => "EAGAIN",
            ExecError::Vm(_) | ExecError::BadRequest(_) => "EINVAL",
        };
        RpcError::new(code, e.to_string())
    }
}

/// Per-connection protocol state.
#[derive(Default)]
pub struct Connection {
    subscribed: bool,
}

impl Connection {
    pub fn new() -> Self {
        Connection::default()
    }

    /// Handles one request line, returning the JSON response frame.
    pub fn handle_line(&mut self, exec: &mut Executive, line: &str) -> Value {
        let request: Request = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                return json!({
                    "seq": 0,
                    "ok": false,
                    "error": { "code": "EINVAL", "message": format!("bad frame: {e}") },
                })
            }
        };
        let seq = request.seq;
        exec.touch_session();
        match self.dispatch(exec, &request) {
            Ok(result) => json!({ "seq": seq, "ok": true, "result": result }),
            Err(e) => json!({
                "seq": seq,
                "ok": false,
                "error": { "code": e.code, "message": e.message },
            }),
        }
    }

    /// Event frames ready for the wire; empty until `events.subscribe`.
    pub fn pending_events(&mut self, exec: &mut Executive, max: usize) -> Vec<Value> {
        if !self.subscribed {
            return Vec::new();
        }
        exec.events_take(max)
            .into_iter()
            .map(|e| {
                json!({
                    "event": e.category,
                    "seq": e.seq,
                    "body": {
                        "pid": e.pid.0,
                        "time_us": e.time_us,
                        "payload": e.payload,
                    },
                })
            })
            .collect()
    }

    fn dispatch(&mut self, exec: &mut Executive, req: &Request) -> Result<Value, RpcError> {
        let a = &req.args;
        match req.cmd.as_str() {
            "session.open" => {
                let client = opt_str(a, "client").unwrap_or("debugger");
                let auth = match opt_str(a, "auth") {
                    Some("admin") | None => AuthLevel::Admin,
                    Some("user") => AuthLevel::User,
                    Some(other) => {
                        return Err(RpcError::new("EINVAL", format!("bad auth {other:?}")))
                    }
                };
                let info = exec.attach(client, auth)?;
                Ok(serde_json::to_value(info).expect("session info serialises"))
            }
            "session.close" => {
                exec.detach()?;
                self.subscribed = false;
                Ok(json!({}))
            }
            "session.keepalive" => Ok(json!({})),

            "ps" => Ok(serde_json::to_value(exec.ps()).expect("snapshots serialise")),

            "vm.set_context" => {
                let pid = pid_arg(a)?;
                exec.debug_reg_get(pid, RegSel::Pc)?; // existence + session check
                Ok(json!({ "pid": pid.0 }))
            }
            "vm.step" => {
                let pid = pid_arg(a)?;
                let n = opt_u64(a, "n").unwrap_or(1) as u32;
                let pc = exec.step_task(pid, n)?;
                Ok(json!({ "pc": pc }))
            }
            "vm.clock" => {
                let pid = pid_arg(a)?;
                let n = opt_u64(a, "n")
                    .ok_or_else(|| RpcError::new("EINVAL", "missing n"))? as u32;
                let pc = exec.step_task(pid, n)?;
                Ok(json!({ "pc": pc }))
            }
            "vm.continue" => {
                let pid = pid_arg(a)?;
                exec.continue_task(pid)?;
                Ok(json!({}))
            }
            "vm.pause" => {
                let pid = pid_arg(a)?;
                exec.stop_task(pid)?;
                Ok(json!({}))
            }
            "vm.step_over" => {
                let pid = pid_arg(a)?;
                exec.step_over(pid)?;
                Ok(json!({}))
            }
            "vm.step_out" => {
                let pid = pid_arg(a)?;
                exec.step_out(pid)?;
                Ok(json!({}))
            }
            "run" => {
                let ticks = opt_u64(a, "ticks").unwrap_or(1);
                let used = exec.run(ticks);
                Ok(json!({ "ticks": used }))
            }

            "reg.get" => {
                let pid = pid_arg(a)?;
                let sel = reg_arg(a)?;
                let v = exec.debug_reg_get(pid, sel)?;
                Ok(json!({ "value": v }))
            }
            "reg.set" => {
                let pid = pid_arg(a)?;
                let sel = reg_arg(a)?;
                let v = opt_u64(a, "value")
                    .ok_or_else(|| RpcError::new("EINVAL", "missing value"))?;
                exec.debug_reg_set(pid, sel, v as u32)?;
                Ok(json!({}))
            }

            "bp.set" => {
                let pid = pid_arg(a)?;
                let addr = opt_u64(a, "addr")
                    .ok_or_else(|| RpcError::new("EINVAL", "missing addr"))?;
                exec.bp_set(pid, addr as u32, false)?;
                Ok(json!({}))
            }
            "bp.clear" => {
                let pid = pid_arg(a)?;
                let addr = opt_u64(a, "addr")
                    .ok_or_else(|| RpcError::new("EINVAL", "missing addr"))?;
                exec.bp_clear(pid, addr as u32)?;
                Ok(json!({}))
            }
            "bp.list" => {
                let pid = pid_arg(a)?;
                Ok(json!({ "breakpoints": exec.bp_list(pid)? }))
            }

            "mbox.list" => {
                let rows: Vec<Value> = exec
                    .mailbox_list()
                    .into_iter()
                    .map(|(h, name, owner)| {
                        json!({ "handle": h.0, "name": name, "owner": owner.0 })
                    })
                    .collect();
                Ok(json!({ "mailboxes": rows }))
            }
            "mbox.inspect" => {
                let h = hsx_abi::Handle(
                    opt_u64(a, "handle")
                        .ok_or_else(|| RpcError::new("EINVAL", "missing handle"))?
                        as u32,
                );
                let info = exec.mailbox_inspect(h)?;
                Ok(json!({
                    "name": info.name,
                    "capacity": info.capacity,
                    "mode": info.mode.bits(),
                    "owner": info.owner.0,
                    "readers": info.readers.iter().map(|p| p.0).collect::<Vec<_>>(),
                    "taps": info.taps.iter().map(|p| p.0).collect::<Vec<_>>(),
                    "waiters": info.waiters.iter().map(|p| p.0).collect::<Vec<_>>(),
                    "depth_bytes": info.depth_bytes,
                    "stats": {
                        "sends": info.stats.sends,
                        "receives": info.stats.receives,
                        "drops": info.stats.drops,
                        "high_water": info.stats.high_water,
                    },
                }))
            }

            "val.list" => {
                let rows: Vec<Value> = exec
                    .value_entries()
                    .iter()
                    .map(|e| {
                        let descriptors = exec.value_descriptors(e.descriptor_offset);
                        json!({
                            "oid": e.oid,
                            "value": half::f16::from_bits(e.value_bits).to_f32(),
                            "flags": e.flags,
                            "auth": e.auth,
                            "pid": e.pid,
                            "descriptors": descriptors
                                .iter()
                                .map(|d| format!("{d:?}"))
                                .collect::<Vec<_>>(),
                        })
                    })
                    .collect();
                Ok(json!({ "values": rows }))
            }
            "val.get" => {
                let oid = oid_arg(a)?;
                let bits = exec.value_get(oid)?;
                Ok(json!({
                    "oid": oid.0,
                    "value": half::f16::from_bits(bits).to_f32(),
                    "bits": bits,
                }))
            }
            "val.set" => {
                let oid = oid_arg(a)?;
                let bits = value_bits_arg(a)?;
                let auth = exec.session_auth();
                exec.value_set(oid, bits, auth)?;
                Ok(json!({}))
            }
            "val.stats" => Ok(json!({
                "count": exec.value_entries().len(),
            })),

            "cmd.list" => {
                let rows: Vec<Value> = exec
                    .command_entries()
                    .iter()
                    .map(|e| {
                        json!({
                            "oid": e.oid,
                            "handler": e.handler_address,
                            "flags": e.flags,
                            "auth": e.auth,
                            "owner": e.owner_pid,
                        })
                    })
                    .collect();
                Ok(json!({ "commands": rows }))
            }
            "cmd.call" => {
                let oid = oid_arg(a)?;
                let token = opt_u64(a, "token").map(|t| t as u32);
                let auth = exec.session_auth();
                let (code, value) = exec.host_command_call(oid, token, auth);
                Ok(json!({ "status": format!("{code:?}"), "value": value }))
            }
            "cmd.stats" => {
                let oid = oid_arg(a)?;
                Ok(json!({ "calls": exec.command_call_count(oid) }))
            }

            "disassemble" => {
                let pid = pid_arg(a)?;
                let addr = opt_u64(a, "addr").unwrap_or(0) as u32;
                let count = opt_u64(a, "count").unwrap_or(16) as usize;
                let rows: Vec<Value> = exec
                    .disassemble(pid, addr, count)?
                    .into_iter()
                    .map(|(at, text)| json!({ "addr": at, "text": text }))
                    .collect();
                Ok(json!({ "instructions": rows }))
            }
            "readMemory" => {
                let pid = pid_arg(a)?;
                let addr = opt_u64(a, "addr")
                    .ok_or_else(|| RpcError::new("EINVAL", "missing addr"))?
                    as u32;
                let len = opt_u64(a, "len").unwrap_or(64) as usize;
                let bytes = exec.read_memory(pid, addr, len)?;
                Ok(json!({ "addr": addr, "bytes": hex_encode(&bytes) }))
            }
            "writeMemory" => {
                let pid = pid_arg(a)?;
                let addr = opt_u64(a, "addr")
                    .ok_or_else(|| RpcError::new("EINVAL", "missing addr"))?
                    as u32;
                let hex = opt_str(a, "bytes")
                    .ok_or_else(|| RpcError::new("EINVAL", "missing bytes"))?;
                let bytes = hex_decode(hex)
                    .ok_or_else(|| RpcError::new("EINVAL", "bad hex payload"))?;
                exec.write_memory(pid, addr, &bytes)?;
                Ok(json!({}))
            }

            "traceControl" => {
                let enabled = a
                    .get("enabled")
                    .and_then(Value::as_bool)
                    .ok_or_else(|| RpcError::new("EINVAL", "missing enabled"))?;
                exec.trace_control(enabled);
                Ok(json!({}))
            }
            "traceRecords" => {
                let rows: Vec<Value> = exec
                    .trace_records()
                    .into_iter()
                    .map(|r| {
                        json!({
                            "entry": format!("{:?}", r.entry),
                            "count": r.count,
                            "time_us": r.time_us,
                        })
                    })
                    .collect();
                Ok(json!({ "records": rows }))
            }

            "events.subscribe" => {
                self.subscribed = true;
                // A resumed session sees its unacknowledged events
                // again, first.
                let replay: Vec<Value> = exec
                    .events_replay()
                    .into_iter()
                    .map(|e| json!({ "event": e.category, "seq": e.seq, "body": e.payload }))
                    .collect();
                Ok(json!({ "replay": replay }))
            }
            "events.ack" => {
                let seq = opt_u64(a, "seq")
                    .ok_or_else(|| RpcError::new("EINVAL", "missing seq"))?;
                exec.events_ack(seq);
                Ok(json!({}))
            }

            other => Err(RpcError::new("EINVAL", format!("unknown cmd {other:?}"))),
        }
    }
}

/// Serves one connection over line-delimited frames until EOF.
pub fn serve<R: BufRead, W: Write>(
    exec: &mut Executive,
    reader: R,
    mut writer: W,
) -> std::io::Result<()> {
    let mut conn = Connection::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        tracing::debug!(frame = %line, "request");
        let response = conn.handle_line(exec, &line);
        serde_json::to_writer(&mut writer, &response)?;
        writer.write_all(b"\n")?;
        for frame in conn.pending_events(exec, 64) {
            serde_json::to_writer(&mut writer, &frame)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
    }
    Ok(())
}

fn opt_str<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str)
}

fn opt_u64(v: &Value, key: &str) -> Option<u64> {
    v.get(key).and_then(Value::as_u64)
}

fn pid_arg(v: &Value) -> Result<Pid, RpcError> {
    opt_u64(v, "pid")
        .map(|p| Pid(p as u16))
        .ok_or_else(|| RpcError::new("EINVAL", "missing pid"))
}

fn oid_arg(v: &Value) -> Result<Oid, RpcError> {
    opt_u64(v, "oid")
        .map(|o| Oid(o as u16))
        .ok_or_else(|| RpcError::new("EINVAL", "missing oid"))
}

fn reg_arg(v: &Value) -> Result<RegSel, RpcError> {
    let name = opt_str(v, "reg").ok_or_else(|| RpcError::new("EINVAL", "missing reg"))?;
    match name.to_ascii_lowercase().as_str() {
        "pc" => Ok(RegSel::Pc),
        "sp" => Ok(RegSel::Sp),
        "wp" => Ok(RegSel::Wp),
        "psw" => Ok(RegSel::Psw),
        r => {
            let n = r
                .strip_prefix('r')
                .and_then(|n| n.parse::<u8>().ok())
                .filter(|n| *n < 16)
                .ok_or_else(|| RpcError::new("EINVAL", format!("bad register {name:?}")))?;
            Ok(RegSel::R(n))
        }
    }
}

/// `val.set` takes either raw bits or a float.
fn value_bits_arg(v: &Value) -> Result<u16, RpcError> {
    if let Some(bits) = opt_u64(v, "bits") {
        return Ok(bits as u16);
    }
    if let Some(f) = v.get("value").and_then(Value::as_f64) {
        return Ok(half::f16::from_f64(f).to_bits());
    }
    Err(RpcError::new("EINVAL", "missing bits or value"))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hsx_kern::{Drivers, ExecConfig};

    fn exec() -> Executive {
        Executive::new(ExecConfig::default(), Drivers::default())
    }

    fn call(conn: &mut Connection, exec: &mut Executive, frame: &str) -> Value {
        conn.handle_line(exec, frame)
    }

    #[test]
    fn session_lock_admits_one_debugger() {
        let mut exec = exec();
        let mut conn = Connection::new();
        let r = call(
            &mut conn,
            &mut exec,
            r#"{"cmd":"session.open","args":{"client":"a"},"seq":1}"#,
        );
        assert_eq!(r["ok"], true, "first attach must succeed: {r}");
        let r2 = call(
            &mut conn,
            &mut exec,
            r#"{"cmd":"session.open","args":{"client":"b"},"seq":2}"#,
        );
        assert_eq!(r2["ok"], false);
        assert_eq!(r2["error"]["code"], "EPERM");
        // The same client reconnecting resumes.
        let r3 = call(
            &mut conn,
            &mut exec,
            r#"{"cmd":"session.open","args":{"client":"a"},"seq":3}"#,
        );
        assert_eq!(r3["ok"], true);
        assert_eq!(r3["result"]["resumed"], true);
    }

    #[test]
    fn unknown_cmd_is_einval_and_unknown_fields_are_ignored() {
        let mut exec = exec();
        let mut conn = Connection::new();
        let r = call(
            &mut conn,
            &mut exec,
            r#"{"cmd":"no.such","args":{},"seq":9,"future_field":42}"#,
        );
        assert_eq!(r["seq"], 9);
        assert_eq!(r["ok"], false);
        assert_eq!(r["error"]["code"], "EINVAL");
    }

    #[test]
    fn malformed_frame_is_rejected_not_fatal() {
        let mut exec = exec();
        let mut conn = Connection::new();
        let r = call(&mut conn, &mut exec, "{nonsense");
        assert_eq!(r["ok"], false);
        // The connection keeps working.
        let r2 = call(&mut conn, &mut exec, r#"{"cmd":"ps","seq":1}"#);
        assert_eq!(r2["ok"], true);
    }

    #[test]
    fn hex_round_trips() {
        let data = vec![0x00, 0xAB, 0xFF, 0x10];
        assert_eq!(hex_decode(&hex_encode(&data)).unwrap(), data);
        assert!(hex_decode("abc").is_none());
        assert!(hex_decode("zz").is_none());
    }

    #[test]
    fn events_flow_only_after_subscribe() {
        let mut exec = exec();
        let mut conn = Connection::new();
        call(
            &mut conn,
            &mut exec,
            r#"{"cmd":"session.open","args":{"client":"a"},"seq":1}"#,
        );
        assert!(conn.pending_events(&mut exec, 16).is_empty());
        call(&mut conn, &mut exec, r#"{"cmd":"events.subscribe","seq":2}"#);
        // No activity yet, so still empty, but the path is open.
        assert!(conn.pending_events(&mut exec, 16).is_empty());
    }
}
