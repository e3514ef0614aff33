//! LDAPv3 over TCP, TLS or StartTLS, one connection per operation.

use super::ber::{
    self, Element, Reader, application_constructed, application_primitive, context_primitive,
};
use super::tls::{self, LdapTlsConfig};
use super::{
    DirectoryClient, DirectoryEntry, DirectoryError, Filter, LdapScheme, LdapUrl, SearchRequest,
};
use crate::RemoteError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::{debug, warn};

const LDAP_VERSION: i64 = 3;
const RESULT_SUCCESS: i64 = 0;
const RESULT_SIZE_LIMIT_EXCEEDED: i64 = 4;
const RESULT_INVALID_CREDENTIALS: i64 = 49;
const DEREF_ALWAYS: i64 = 3;
// Two is enough to tell a unique match from an ambiguous one.
const SEARCH_SIZE_LIMIT: i64 = 2;
const MAX_MESSAGE_SIZE: usize = 1 << 20;

const BIND_REQUEST: u8 = application_constructed(0);
const BIND_RESPONSE: u8 = application_constructed(1);
const UNBIND_REQUEST: u8 = application_primitive(2);
const SEARCH_REQUEST: u8 = application_constructed(3);
const SEARCH_RESULT_ENTRY: u8 = application_constructed(4);
const SEARCH_RESULT_DONE: u8 = application_constructed(5);
const SEARCH_RESULT_REFERENCE: u8 = application_constructed(19);
const EXTENDED_REQUEST: u8 = application_constructed(23);
const EXTENDED_RESPONSE: u8 = application_constructed(24);
const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";

/// Service account used to search before the user's own bind.
#[derive(Debug, Clone)]
pub struct BindCredentials {
    pub dn: String,
    pub password: String,
}

trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

enum Security {
    Cleartext,
    Tls(TlsConnector, ServerName<'static>),
    StartTls(TlsConnector, ServerName<'static>),
}

/// A [`DirectoryClient`] speaking LDAPv3 over TCP.
pub struct TcpDirectoryClient {
    address: String,
    service_account: Option<BindCredentials>,
    security: Security,
    timeout: Duration,
}

impl TcpDirectoryClient {
    pub fn new(
        url: &LdapUrl,
        service_account: Option<BindCredentials>,
        tls: &LdapTlsConfig,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let security = match (url.scheme, tls.insecure) {
            (LdapScheme::Ldaps, true) => {
                return Err(RemoteError::Unsupported(
                    "ldaps:// cannot be combined with insecure".to_string(),
                ));
            }
            (LdapScheme::Ldap, true) => {
                warn!(address = %url.host, "directory credentials will be sent in cleartext");
                Security::Cleartext
            }
            (LdapScheme::Ldaps, false) => Security::Tls(
                tls::connector(tls.ca_file.as_deref())?,
                tls::server_name(&url.host)?,
            ),
            (LdapScheme::Ldap, false) => Security::StartTls(
                tls::connector(tls.ca_file.as_deref())?,
                tls::server_name(&url.host)?,
            ),
        };
        Ok(Self {
            address: url.host.clone(),
            service_account,
            security,
            timeout,
        })
    }

    async fn connect(&self) -> Result<Connection<Box<dyn Transport>>, DirectoryError> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| DirectoryError::Connection(format!("{}: {e}", self.address)))?;
        let stream: Box<dyn Transport> = match &self.security {
            Security::Cleartext => Box::new(stream),
            Security::Tls(connector, name) => {
                Box::new(self.handshake(connector, name, stream).await?)
            }
            Security::StartTls(connector, name) => {
                let mut plain = Connection::new(stream);
                plain.start_tls().await?;
                Box::new(self.handshake(connector, name, plain.stream).await?)
            }
        };
        Ok(Connection::new(stream))
    }

    async fn handshake(
        &self,
        connector: &TlsConnector,
        name: &ServerName<'static>,
        stream: TcpStream,
    ) -> Result<TlsStream<TcpStream>, DirectoryError> {
        connector
            .connect(name.clone(), stream)
            .await
            .map_err(|e| DirectoryError::Connection(format!("{}: TLS: {e}", self.address)))
    }

    async fn timed<T>(
        &self,
        work: impl Future<Output = Result<T, DirectoryError>>,
    ) -> Result<T, DirectoryError> {
        tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| DirectoryError::Connection(format!("{}: timed out", self.address)))?
    }

    async fn service_bind<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        connection: &mut Connection<S>,
    ) -> Result<(), DirectoryError> {
        let Some(account) = &self.service_account else {
            return Ok(());
        };
        connection
            .bind(&account.dn, &account.password)
            .await
            .map_err(|e| match e {
                DirectoryError::InvalidCredentials => DirectoryError::Operation {
                    code: RESULT_INVALID_CREDENTIALS,
                    message: "service account bind rejected".to_string(),
                },
                other => other,
            })
    }
}

#[async_trait]
impl DirectoryClient for TcpDirectoryClient {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        let filter = Filter::parse(&request.filter).map_err(DirectoryError::Protocol)?;

        self.timed(async {
            let mut connection = self.connect().await?;
            let result = match self.service_bind(&mut connection).await {
                Ok(()) => connection.search(request, &filter).await,
                Err(err) => Err(err),
            };
            connection.unbind().await;
            result
        })
        .await
    }

    async fn bind(&self, dn: &str, password: &str) -> Result<(), DirectoryError> {
        self.timed(async {
            let mut connection = self.connect().await?;
            let result = connection.bind(dn, password).await;
            connection.unbind().await;
            result
        })
        .await
    }
}

struct Connection<S> {
    stream: S,
    buffer: Vec<u8>,
    next_id: i64,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
            next_id: 1,
        }
    }

    async fn send(&mut self, operation: Vec<u8>) -> Result<i64, DirectoryError> {
        let id = self.next_id;
        self.next_id += 1;
        let message = ber::constructed(ber::SEQUENCE, &[ber::integer(id), operation]);
        self.stream
            .write_all(&message)
            .await
            .map_err(|e| DirectoryError::Connection(e.to_string()))?;
        Ok(id)
    }

    /// Reads the next complete LDAPMessage.
    async fn receive(&mut self) -> Result<Vec<u8>, DirectoryError> {
        loop {
            if let Some((_, header, content)) =
                ber::parse_header(&self.buffer).map_err(DirectoryError::Protocol)?
            {
                let total = header
                    .checked_add(content)
                    .filter(|total| *total <= MAX_MESSAGE_SIZE)
                    .ok_or_else(|| {
                        DirectoryError::Protocol(format!(
                            "message of {content} content bytes exceeds limit"
                        ))
                    })?;
                if self.buffer.len() >= total {
                    let rest = self.buffer.split_off(total);
                    return Ok(std::mem::replace(&mut self.buffer, rest));
                }
            }

            let mut chunk = [0u8; 4096];
            let read = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|e| DirectoryError::Connection(e.to_string()))?;
            if read == 0 {
                return Err(DirectoryError::Connection(
                    "connection closed by directory".to_string(),
                ));
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    /// Asks the directory to switch this connection to TLS.
    async fn start_tls(&mut self) -> Result<(), DirectoryError> {
        let request = ber::constructed(
            EXTENDED_REQUEST,
            &[ber::tlv(context_primitive(0), START_TLS_OID.as_bytes())],
        );
        let id = self.send(request).await?;

        let message = self.receive().await?;
        let (response_id, operation) = split_message(&message)?;
        if response_id != id || operation.tag != EXTENDED_RESPONSE {
            return Err(DirectoryError::Protocol("unexpected StartTLS response".to_string()));
        }
        if !self.buffer.is_empty() {
            return Err(DirectoryError::Protocol(
                "cleartext data received after StartTLS".to_string(),
            ));
        }
        match ldap_result(&operation)? {
            (RESULT_SUCCESS, _) => Ok(()),
            (code, message) => Err(DirectoryError::Operation { code, message }),
        }
    }

    async fn bind(&mut self, dn: &str, password: &str) -> Result<(), DirectoryError> {
        let request = ber::constructed(
            BIND_REQUEST,
            &[
                ber::integer(LDAP_VERSION),
                ber::octet_string(dn.as_bytes()),
                ber::tlv(context_primitive(0), password.as_bytes()),
            ],
        );
        let id = self.send(request).await?;

        let message = self.receive().await?;
        let (response_id, operation) = split_message(&message)?;
        if response_id != id || operation.tag != BIND_RESPONSE {
            return Err(DirectoryError::Protocol("unexpected bind response".to_string()));
        }

        match ldap_result(&operation)? {
            (RESULT_SUCCESS, _) => Ok(()),
            (RESULT_INVALID_CREDENTIALS, _) => Err(DirectoryError::InvalidCredentials),
            (code, message) => Err(DirectoryError::Operation { code, message }),
        }
    }

    async fn search(
        &mut self,
        request: &SearchRequest,
        filter: &Filter,
    ) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        let attributes: Vec<Vec<u8>> = request
            .attributes
            .iter()
            .map(|name| ber::octet_string(name.as_bytes()))
            .collect();
        let operation = ber::constructed(
            SEARCH_REQUEST,
            &[
                ber::octet_string(request.base_dn.as_bytes()),
                ber::enumerated(request.scope as i64),
                ber::enumerated(DEREF_ALWAYS),
                ber::integer(SEARCH_SIZE_LIMIT),
                ber::integer(0),
                ber::boolean(false),
                filter.encode(),
                ber::constructed(ber::SEQUENCE, &attributes),
            ],
        );
        let id = self.send(operation).await?;

        let mut entries = Vec::new();
        loop {
            let message = self.receive().await?;
            let (response_id, operation) = split_message(&message)?;
            if response_id != id {
                return Err(DirectoryError::Protocol("unexpected message id".to_string()));
            }

            match operation.tag {
                SEARCH_RESULT_ENTRY => entries.push(parse_entry(&operation)?),
                SEARCH_RESULT_REFERENCE => debug!("ignoring search continuation reference"),
                SEARCH_RESULT_DONE => {
                    return match ldap_result(&operation)? {
                        (RESULT_SUCCESS, _) => Ok(entries),
                        (RESULT_SIZE_LIMIT_EXCEEDED, _) if !entries.is_empty() => Ok(entries),
                        (code, message) => Err(DirectoryError::Operation { code, message }),
                    };
                }
                tag => {
                    return Err(DirectoryError::Protocol(format!(
                        "unexpected operation 0x{tag:02x} in search response"
                    )));
                }
            }
        }
    }

    async fn unbind(&mut self) {
        let _ = self.send(ber::tlv(UNBIND_REQUEST, &[])).await;
        let _ = self.stream.shutdown().await;
    }
}

fn split_message(message: &[u8]) -> Result<(i64, Element<'_>), DirectoryError> {
    let outer = Reader::new(message).next().map_err(DirectoryError::Protocol)?;
    let children = outer.children().map_err(DirectoryError::Protocol)?;
    match children.as_slice() {
        [id, operation, ..] if id.tag == ber::INTEGER => Ok((
            id.as_integer().map_err(DirectoryError::Protocol)?,
            operation.clone(),
        )),
        _ => Err(DirectoryError::Protocol("malformed LDAP message".to_string())),
    }
}

fn ldap_result(operation: &Element<'_>) -> Result<(i64, String), DirectoryError> {
    let children = operation.children().map_err(DirectoryError::Protocol)?;
    match children.as_slice() {
        [code, _matched, diagnostic, ..] if code.tag == ber::ENUMERATED => Ok((
            code.as_integer().map_err(DirectoryError::Protocol)?,
            diagnostic.as_string(),
        )),
        _ => Err(DirectoryError::Protocol("malformed LDAP result".to_string())),
    }
}

fn parse_entry(operation: &Element<'_>) -> Result<DirectoryEntry, DirectoryError> {
    let children = operation.children().map_err(DirectoryError::Protocol)?;
    let [name, attributes] = children.as_slice() else {
        return Err(DirectoryError::Protocol("malformed search entry".to_string()));
    };

    let mut entry = DirectoryEntry {
        dn: name.as_string(),
        attributes: HashMap::new(),
    };
    for attribute in attributes.children().map_err(DirectoryError::Protocol)? {
        let parts = attribute.children().map_err(DirectoryError::Protocol)?;
        let [kind, values] = parts.as_slice() else {
            return Err(DirectoryError::Protocol("malformed attribute".to_string()));
        };
        let values = values
            .children()
            .map_err(DirectoryError::Protocol)?
            .iter()
            .map(Element::as_string)
            .collect();
        entry.attributes.insert(kind.as_string(), values);
    }
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap::SearchScope;
    use tokio::net::TcpListener;

    fn result(tag: u8, code: i64, message: &str) -> Vec<u8> {
        ber::constructed(
            tag,
            &[
                ber::enumerated(code),
                ber::octet_string(b""),
                ber::octet_string(message.as_bytes()),
            ],
        )
    }

    fn envelope(id: i64, operation: Vec<u8>) -> Vec<u8> {
        ber::constructed(ber::SEQUENCE, &[ber::integer(id), operation])
    }

    fn search_entry(dn: &str, attributes: &[(&str, &str)]) -> Vec<u8> {
        let attributes: Vec<Vec<u8>> = attributes
            .iter()
            .map(|(kind, value)| {
                ber::constructed(
                    ber::SEQUENCE,
                    &[
                        ber::octet_string(kind.as_bytes()),
                        ber::constructed(ber::SET, &[ber::octet_string(value.as_bytes())]),
                    ],
                )
            })
            .collect();
        ber::constructed(
            SEARCH_RESULT_ENTRY,
            &[
                ber::octet_string(dn.as_bytes()),
                ber::constructed(ber::SEQUENCE, &attributes),
            ],
        )
    }

    /// Serves one connection, answering requests with `responses` in order.
    async fn scripted_directory(responses: Vec<Vec<Vec<u8>>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            for batch in responses {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await.unwrap();
                for message in batch {
                    socket.write_all(&message).await.unwrap();
                }
            }
        });
        address
    }

    fn client(address: &str) -> TcpDirectoryClient {
        let url = LdapUrl::parse(&format!("ldap://{address}/dc=example")).unwrap();
        let cleartext = LdapTlsConfig {
            insecure: true,
            ca_file: None,
        };
        TcpDirectoryClient::new(&url, None, &cleartext, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_bind_result_codes() {
        let address =
            scripted_directory(vec![vec![envelope(1, result(BIND_RESPONSE, 0, ""))]]).await;
        client(&address).bind("uid=a,dc=example", "pw").await.unwrap();

        let address = scripted_directory(vec![vec![envelope(
            1,
            result(BIND_RESPONSE, RESULT_INVALID_CREDENTIALS, "invalid credentials"),
        )]])
        .await;
        let err = client(&address).bind("uid=a,dc=example", "bad").await.unwrap_err();
        assert_eq!(err, DirectoryError::InvalidCredentials);
    }

    #[tokio::test]
    async fn test_search_collects_entries() {
        let address = scripted_directory(vec![vec![
            envelope(
                1,
                search_entry(
                    "uid=alice,dc=example",
                    &[("uid", "alice"), ("mail", "a@example.com")],
                ),
            ),
            envelope(1, result(SEARCH_RESULT_DONE, 0, "")),
        ]])
        .await;

        let entries = client(&address)
            .search(&SearchRequest {
                base_dn: "dc=example".to_string(),
                scope: SearchScope::Sub,
                filter: "(uid=alice)".to_string(),
                attributes: vec!["uid".to_string(), "mail".to_string()],
            })
            .await
            .unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].dn, "uid=alice,dc=example");
        assert_eq!(entries[0].attributes["mail"], vec!["a@example.com"]);
    }

    #[tokio::test]
    async fn test_unreachable_directory() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = client(&address).bind("dn", "pw").await.unwrap_err();
        assert!(matches!(err, DirectoryError::Connection(_)));
    }

    #[test]
    fn test_transport_security() {
        let timeout = Duration::from_secs(1);
        let secure = LdapTlsConfig::default();
        let insecure = LdapTlsConfig {
            insecure: true,
            ca_file: None,
        };

        let ldaps = LdapUrl::parse("ldaps://ldap.example.com/dc=example").unwrap();
        let client = TcpDirectoryClient::new(&ldaps, None, &secure, timeout).unwrap();
        assert!(matches!(client.security, Security::Tls(..)));
        assert!(matches!(
            TcpDirectoryClient::new(&ldaps, None, &insecure, timeout),
            Err(RemoteError::Unsupported(_))
        ));

        let ldap = LdapUrl::parse("ldap://ldap.example.com/dc=example").unwrap();
        let client = TcpDirectoryClient::new(&ldap, None, &secure, timeout).unwrap();
        assert!(matches!(client.security, Security::StartTls(..)));
        let client = TcpDirectoryClient::new(&ldap, None, &insecure, timeout).unwrap();
        assert!(matches!(client.security, Security::Cleartext));
    }

    #[tokio::test]
    async fn test_start_tls_precedes_credentials() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (sent, received) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let read = socket.read(&mut buf).await.unwrap();
            let _ = sent.send(buf[..read].to_vec());
            let refused = result(EXTENDED_RESPONSE, 2, "StartTLS not supported");
            socket.write_all(&envelope(1, refused)).await.unwrap();
        });

        let url = LdapUrl::parse(&format!("ldap://{address}/dc=example")).unwrap();
        let client =
            TcpDirectoryClient::new(&url, None, &LdapTlsConfig::default(), Duration::from_secs(5))
                .unwrap();
        let err = client.bind("uid=a,dc=example", "secret").await.unwrap_err();
        assert!(matches!(err, DirectoryError::Operation { code: 2, .. }));

        let first = received.await.unwrap();
        let start_tls = ber::constructed(
            EXTENDED_REQUEST,
            &[ber::tlv(context_primitive(0), START_TLS_OID.as_bytes())],
        );
        assert_eq!(first, envelope(1, start_tls));
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let huge = vec![0x30, 0x88, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
        let address = scripted_directory(vec![vec![huge]]).await;
        let err = client(&address).bind("uid=a,dc=example", "pw").await.unwrap_err();
        assert!(matches!(err, DirectoryError::Protocol(_)));
    }
}
