//! Handshake composition: the setup request sent first on every connection.

use crate::config::Config;
use crate::error::Result;
use crate::request::{Request, RequestConfig};
use crate::response::Response;

/// Builds the setup request: `HELLO 3` with optional inline `AUTH` and
/// `SETNAME`, a `SELECT` when a database index is configured, then any
/// user-provided setup commands.
///
/// The request carries HELLO priority so it overtakes user requests queued
/// before the connection was established, and both connection-loss flags so
/// a dead connection never leaves a stale handshake behind.
pub(crate) fn setup_request(cfg: &Config) -> Request {
    let mut req = Request::with_config(RequestConfig {
        cancel_on_connection_lost: true,
        cancel_if_not_connected: false,
        cancel_if_unresponded: true,
        hello_with_priority: true,
    });

    let mut args: Vec<String> = vec!["3".to_owned()];
    if cfg.password.is_some() || cfg.username.is_some() {
        args.push("AUTH".to_owned());
        // HELLO AUTH requires a username; plain requirepass setups use the
        // default user.
        args.push(cfg.username.clone().unwrap_or_else(|| "default".to_owned()));
        args.push(cfg.password.clone().unwrap_or_default());
    }
    if let Some(clientname) = &cfg.clientname {
        args.push("SETNAME".to_owned());
        args.push(clientname.clone());
    }
    req.push("HELLO", &args);

    if cfg.database_index != 0 {
        req.push("SELECT", &[cfg.database_index.to_string()]);
    }

    if let Some(setup) = &cfg.setup {
        req.append(setup);
    }

    req
}

/// Any error node in the setup response aborts the connection: handshake
/// failures are configuration errors, not transient conditions.
pub(crate) fn check_setup_response(response: &Response) -> Result<()> {
    match response.first_error() {
        Some(err) => Err(err.clone()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::value::Value;

    #[test]
    fn plain_hello() {
        let cfg = Config::default();
        let req = setup_request(&cfg);
        assert_eq!(req.payload(), b"*2\r\n$5\r\nHELLO\r\n$1\r\n3\r\n");
        assert!(req.has_hello_priority());
        assert_eq!(req.expected_responses(), 1);
    }

    #[test]
    fn hello_with_auth_setname_and_select() {
        let cfg = Config {
            username: Some("user".into()),
            password: Some("pass".into()),
            clientname: Some("myapp".into()),
            database_index: 2,
            ..Config::default()
        };
        let req = setup_request(&cfg);
        let payload = String::from_utf8(req.payload().to_vec()).unwrap();
        assert!(payload.starts_with("*7\r\n$5\r\nHELLO\r\n$1\r\n3\r\n$4\r\nAUTH\r\n"));
        assert!(payload.contains("$4\r\nuser\r\n$4\r\npass\r\n"));
        assert!(payload.contains("$7\r\nSETNAME\r\n$5\r\nmyapp\r\n"));
        assert!(payload.contains("$6\r\nSELECT\r\n$1\r\n2\r\n"));
        assert_eq!(req.commands(), 2);
    }

    #[test]
    fn auth_without_username_uses_default_user() {
        let cfg = Config {
            password: Some("secret".into()),
            ..Config::default()
        };
        let req = setup_request(&cfg);
        let payload = String::from_utf8(req.payload().to_vec()).unwrap();
        assert!(payload.contains("$7\r\ndefault\r\n$6\r\nsecret\r\n"));
    }

    #[test]
    fn user_setup_is_appended() {
        let mut setup = Request::new();
        setup.push("CLIENT", &["NO-EVICT", "on"]);
        let cfg = Config {
            setup: Some(setup),
            ..Config::default()
        };
        let req = setup_request(&cfg);
        assert_eq!(req.commands(), 2);
        assert_eq!(req.expected_responses(), 2);
        let payload = String::from_utf8(req.payload().to_vec()).unwrap();
        assert!(payload.ends_with("$6\r\nCLIENT\r\n$8\r\nNO-EVICT\r\n$2\r\non\r\n"));
    }

    #[test]
    fn error_reply_aborts() {
        let response = Response::from_slots(vec![
            Ok(Value::Map(vec![])),
            Err(Error::Resp3SimpleError("ERR DENIED".into())),
        ]);
        assert!(matches!(
            check_setup_response(&response),
            Err(Error::Resp3SimpleError(_))
        ));

        let response = Response::from_slots(vec![Ok(Value::Map(vec![]))]);
        assert!(check_setup_response(&response).is_ok());
    }
}
