//! Compiled-in plugins.
//!
//! `ping` is always present and answers `GET /ping` with a fixed body at
//! the content stage. `trace` is selectable through the load
//! configuration; it stamps a timestamp header at finalize and never
//! claims the connection.

use super::{Capabilities, PluginApi, PluginCtor, PluginSpec, StageContext, StageStatus};
use bytes::Bytes;

/// Plugins registered unconditionally, ahead of any configured load.
pub fn static_plugins() -> &'static [PluginCtor] {
    &[ping_plugin]
}

fn ping_plugin() -> PluginSpec {
    PluginSpec {
        shortname: "ping",
        name: "Liveness responder",
        version: "0.1",
        capabilities: Capabilities::STAGE,
        init: Some(ping_init),
        exit: Some(ping_exit),
        stage30: Some(ping_content),
        ..PluginSpec::empty()
    }
}

fn ping_init(_api: &PluginApi) -> i32 {
    0
}

fn ping_exit() {}

fn ping_content(ctx: &mut StageContext) -> StageStatus {
    let Some(req) = ctx.request else {
        return StageStatus::NotMe;
    };
    if req.method != "GET" || req.target != "/ping" {
        return StageStatus::NotMe;
    }

    let body = Bytes::from_static(b"pong\r\n");
    ctx.headers.status = 200;
    ctx.headers.content_type = Some("text/plain".to_string());
    ctx.headers.content_length = Some(body.len() as u64);
    *ctx.body = Some(body);
    StageStatus::Continue
}

/// Constructor behind the `plugin_trace` provider name.
pub fn trace_plugin() -> PluginSpec {
    PluginSpec {
        shortname: "trace",
        name: "Response timestamp tracer",
        version: "0.1",
        capabilities: Capabilities::STAGE,
        init: Some(trace_init),
        exit: Some(trace_exit),
        stage40: Some(trace_finalize),
        ..PluginSpec::empty()
    }
}

fn trace_init(_api: &PluginApi) -> i32 {
    0
}

fn trace_exit() {}

fn trace_finalize(ctx: &mut StageContext) -> StageStatus {
    let now = (ctx.api.time_unix)();
    ctx.headers
        .extra_rows
        .push(format!("X-Trace-Time: {now}"));
    StageStatus::NotMe
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::header::ResponseHeaders;
    use crate::http::request::{parse, ParseOutcome};
    use crate::plugin::Stage;

    fn request_for(raw: &[u8]) -> crate::http::request::Request {
        match parse(raw) {
            ParseOutcome::Complete(req, _) => req,
            other => panic!("expected a complete request, got {other:?}"),
        }
    }

    #[test]
    fn test_ping_claims_its_route() {
        let api = PluginApi::new();
        let req = request_for(b"GET /ping HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut headers = ResponseHeaders::new(0);
        let mut body = None;
        let mut ctx = StageContext {
            api: &api,
            request: Some(&req),
            headers: &mut headers,
            body: &mut body,
        };

        assert_eq!(ping_content(&mut ctx), StageStatus::Continue);
        assert_eq!(headers.status, 200);
        assert_eq!(headers.content_length, Some(6));
        assert_eq!(body.as_deref(), Some(&b"pong\r\n"[..]));
    }

    #[test]
    fn test_ping_passes_on_other_routes() {
        let api = PluginApi::new();
        let req = request_for(b"GET /other HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut headers = ResponseHeaders::new(0);
        let mut body = None;
        let mut ctx = StageContext {
            api: &api,
            request: Some(&req),
            headers: &mut headers,
            body: &mut body,
        };

        assert_eq!(ping_content(&mut ctx), StageStatus::NotMe);
        assert!(body.is_none());
    }

    #[test]
    fn test_trace_stamps_without_claiming() {
        let api = PluginApi::new();
        let registry =
            crate::plugin::PluginRegistry::load(crate::plugin::providers(), &["trace".to_string()], &api);
        assert!(registry.is_active("trace"));

        let req = request_for(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut headers = ResponseHeaders::new(200);
        let mut body = None;
        let mut ctx = StageContext {
            api: &api,
            request: Some(&req),
            headers: &mut headers,
            body: &mut body,
        };

        assert_eq!(registry.run_stage(Stage::Finalize, &mut ctx), StageStatus::NotMe);
        assert!(headers.extra_rows[0].starts_with("X-Trace-Time: "));
    }
}
