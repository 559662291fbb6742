/// LDAP TCP listener - one task per accepted connection
///
/// The number of connections served at once is capped; further clients wait
/// in the accept backlog. A connection that sends no complete request within
/// the idle timeout is closed.
use super::{
    ber,
    message::LdapMessage,
    session::{LdapSession, Reply},
};
use crate::{
    config::LdapConfig,
    dispatch::QueryDispatcher,
    error::{ResolverError, ResolverResult},
    metrics,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

pub struct LdapListener {
    listener: TcpListener,
    session: LdapSession,
    idle_timeout: Duration,
    slots: Arc<Semaphore>,
}

impl LdapListener {
    /// Bind the listener address from configuration
    pub async fn bind(config: &LdapConfig, dispatcher: Arc<QueryDispatcher>) -> ResolverResult<Self> {
        let addr = format!("{}:{}", config.hostname, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ResolverError::Internal(format!("Failed to bind LDAP listener to {}: {}", addr, e)))?;

        Ok(Self {
            listener,
            session: LdapSession::new(dispatcher, config.base_dn.clone()),
            idle_timeout: config.idle_timeout(),
            slots: Arc::new(Semaphore::new(config.max_connections)),
        })
    }

    pub fn local_addr(&self) -> ResolverResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> ResolverResult<()> {
        info!("LDAP listener accepting connections on {}", self.local_addr()?);

        loop {
            let permit = Arc::clone(&self.slots)
                .acquire_owned()
                .await
                .map_err(|e| ResolverError::Internal(format!("LDAP connection slots closed: {}", e)))?;

            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept LDAP connection: {}", e);
                    continue;
                }
            };

            metrics::LDAP_CONNECTIONS_TOTAL.inc();
            debug!(%peer, "ldap connection accepted");

            let session = self.session.clone();
            let idle_timeout = self.idle_timeout;
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = serve_connection(stream, &session, idle_timeout).await {
                    warn!(%peer, error = %e, "ldap connection closed on error");
                }
                debug!(%peer, "ldap connection closed");
            });
        }
    }
}

/// Read frames until unbind, EOF, idle timeout or a malformed frame
pub async fn serve_connection<S>(
    stream: S,
    session: &LdapSession,
    idle_timeout: Duration,
) -> Result<(), ber::BerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);

    loop {
        let frame = match tokio::time::timeout(idle_timeout, ber::read_frame(&mut stream)).await {
            Ok(frame) => frame?,
            Err(_) => {
                debug!(idle_secs = idle_timeout.as_secs(), "ldap connection idle, closing");
                break;
            }
        };
        let Some(frame) = frame else { break };
        let message = LdapMessage::decode(&frame)?;

        match session.handle(message).await {
            Reply::Frames(frames) => {
                for frame in frames {
                    stream.write_all(&frame).await?;
                }
                stream.flush().await?;
            }
            Reply::Close => break,
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::test_config,
        directory::{Contact, DirectoryIndex, GroupRecord, IdentityRecord},
        ldap::message::{self, client},
        resolver::ResolverLimits,
    };
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    const IDLE: Duration = Duration::from_secs(30);

    fn dispatcher() -> Arc<QueryDispatcher> {
        let records = vec![
            IdentityRecord::Leaf(Contact::new("alice").with_address("alice@x")),
            IdentityRecord::Group(GroupRecord::new(Contact::new("team"), "alice")),
        ];
        Arc::new(QueryDispatcher::new(
            Arc::new(DirectoryIndex::from_records(records)),
            ResolverLimits::default(),
        ))
    }

    #[tokio::test]
    async fn test_bind_search_unbind_over_tcp() {
        let mut config = test_config().ldap;
        config.port = 0;
        let listener = LdapListener::bind(&config, dispatcher()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(listener.run());

        let mut client_stream = TcpStream::connect(addr).await.unwrap();

        client_stream.write_all(&client::bind_request(1)).await.unwrap();
        let ack = ber::read_frame(&mut client_stream).await.unwrap().unwrap();
        assert_eq!(ack, message::encode_bind_response(1));

        let search = client::search_request(
            2,
            "dc=schule,dc=lan",
            2,
            0,
            client::equality("cn", "team"),
            &[],
        );
        client_stream.write_all(&search).await.unwrap();

        let mut tags = Vec::new();
        loop {
            let frame = ber::read_frame(&mut client_stream).await.unwrap().unwrap();
            let (_, tag, _) = client::decode_response(&frame);
            tags.push(tag);
            if tag == message::SEARCH_RESULT_DONE {
                break;
            }
        }
        assert_eq!(
            tags,
            vec![
                message::SEARCH_RESULT_ENTRY,
                message::SEARCH_RESULT_ENTRY,
                message::SEARCH_RESULT_DONE
            ]
        );

        client_stream.write_all(&client::unbind_request(3)).await.unwrap();
        let mut rest = Vec::new();
        client_stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        server.abort();
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_connection() {
        let (client_side, server_side) = tokio::io::duplex(1024);
        let session = LdapSession::new(dispatcher(), "dc=schule,dc=lan");
        let handle =
            tokio::spawn(async move { serve_connection(server_side, &session, IDLE).await });

        let mut client_side = client_side;
        client_side.write_all(&[0x04, 0x00]).await.unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ber::BerError::UnexpectedTag { .. })));
    }

    #[tokio::test]
    async fn test_eof_ends_connection_cleanly() {
        let (client_side, server_side) = tokio::io::duplex(1024);
        let session = LdapSession::new(dispatcher(), "dc=schule,dc=lan");
        drop(client_side);

        serve_connection(server_side, &session, IDLE).await.unwrap();
    }

    #[tokio::test]
    async fn test_half_frame_is_dropped_after_idle_timeout() {
        let (mut client_side, server_side) = tokio::io::duplex(1024);
        let session = LdapSession::new(dispatcher(), "dc=schule,dc=lan");

        // Header promises five bytes, only one arrives
        client_side.write_all(&[0x30, 0x05, 0x02]).await.unwrap();

        let served = tokio::time::timeout(
            Duration::from_secs(5),
            serve_connection(server_side, &session, Duration::from_millis(50)),
        )
        .await;
        assert!(matches!(served, Ok(Ok(()))));
        drop(client_side);
    }

    #[tokio::test]
    async fn test_connection_cap_queues_extra_clients() {
        let mut config = test_config().ldap;
        config.port = 0;
        config.max_connections = 1;
        let listener = LdapListener::bind(&config, dispatcher()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(listener.run());

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(&client::bind_request(1)).await.unwrap();
        ber::read_frame(&mut first).await.unwrap().unwrap();

        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(&client::bind_request(1)).await.unwrap();
        let waiting =
            tokio::time::timeout(Duration::from_millis(100), ber::read_frame(&mut second)).await;
        assert!(waiting.is_err());

        drop(first);
        let ack = ber::read_frame(&mut second).await.unwrap().unwrap();
        assert_eq!(ack, message::encode_bind_response(1));

        server.abort();
    }
}
