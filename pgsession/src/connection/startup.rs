//! Startup phase.
//!
//! <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-START-UP>
use md5::{Digest, Md5};

use super::{Config, ConnectError};
use crate::{
    Result,
    common::{ByteStr, logging, verbose},
    postgres::{BackendMessage, ProtocolError, backend, frontend},
    transport::{PgTransport, PgTransportExt},
};

/// Startup phase successful response.
#[derive(Debug)]
pub struct StartupResponse {
    pub backend_key_data: Option<backend::BackendKeyData>,
    pub param_status: Vec<(ByteStr, ByteStr)>,
}

/// Perform the startup handshake.
pub async fn startup<IO: PgTransport>(config: &Config, io: &mut IO) -> Result<StartupResponse> {
    // To begin a session, a frontend opens a connection to the server and sends a startup message.
    io.send_startup(frontend::Startup {
        user: &config.user,
        database: Some(&config.dbname),
        replication: config.replication_param(),
        application_name: config.application_name.as_deref(),
    });
    io.flush().await?;

    // The server then sends an appropriate authentication request message,
    // to which the frontend must reply with an appropriate authentication response message.
    loop {
        use backend::Authentication::*;
        match io.recv::<BackendMessage>().await? {
            BackendMessage::Authentication(auth) => match auth {
                Ok => break,
                CleartextPassword => {
                    let password = config.pass.resolve();
                    let password = std::str::from_utf8(&password)
                        .map_err(|_| ConnectError::UnsupportedAuth("non utf8 cleartext password"))?;
                    io.send(frontend::PasswordMessage { password });
                    io.flush().await?;
                },
                MD5Password { salt } => {
                    let password = md5_password(config.user.as_bytes(), &config.pass.resolve(), salt);
                    io.send(frontend::PasswordMessage { password: &password });
                    io.flush().await?;
                },
                KerberosV5 => Err(ConnectError::UnsupportedAuth("KerberosV5"))?,
                GSS | GSSContinue { .. } => Err(ConnectError::UnsupportedAuth("GSSAPI"))?,
                SSPI => Err(ConnectError::UnsupportedAuth("SSPI"))?,
                SASL { .. } | SASLContinue { .. } | SASLFinal { .. } => {
                    Err(ConnectError::UnsupportedAuth("SASL"))?
                },
            },
            BackendMessage::ErrorResponse(err) => Err(err.to_db_error()?)?,
            BackendMessage::NegotiateProtocolVersion(_) => { },
            f => Err(ProtocolError::unexpected_during(f.msgtype(), "authentication"))?,
        }
    }

    // After having received AuthenticationOk, the backend will send some ParameterStatus messages,
    // BackendKeyData, and finally ReadyForQuery.
    let mut param_status = vec![];
    let mut key_data = None;

    loop {
        use BackendMessage::*;
        match io.recv().await? {
            ReadyForQuery(_) => break,
            BackendKeyData(new_key_data) => key_data = Some(new_key_data),
            ParameterStatus(param) => {
                verbose!("{} = {}", param.name, param.value);
                param_status.push((param.name, param.value));
            },
            NoticeResponse(notice) => {
                let _notice = notice.to_db_error()?;
                logging!(warn, "startup notice: {_notice}");
            },
            ErrorResponse(err) => Err(err.to_db_error()?)?,
            NegotiateProtocolVersion(_) => { },
            f => Err(ProtocolError::unexpected_during(f.msgtype(), "startup phase"))?,
        }
    }

    Ok(StartupResponse { backend_key_data: key_data, param_status })
}

/// `concat('md5', md5(concat(md5(concat(password, username)), random-salt)))`
fn md5_password(user: &[u8], password: &[u8], salt: [u8; 4]) -> String {
    let mut md5 = Md5::new();
    md5.update(password);
    md5.update(user);
    let inner = format!("{:x}", md5.finalize_reset());
    md5.update(inner.as_bytes());
    md5.update(salt);
    format!("md5{:x}", md5.finalize())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn md5_password_hash() {
        // select 'md5' || md5(md5('secret' || 'app') || 'salt')
        let hash = md5_password(b"app", b"secret", *b"salt");
        assert!(hash.starts_with("md5"));
        assert_eq!(hash.len(), 3 + 32);
        assert_ne!(hash, md5_password(b"app", b"secret", *b"SALT"));
    }
}
