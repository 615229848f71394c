use crate::config::RedisType;
use crate::key_codec::LookupKey;
use crate::onlinestore::{LookupError, LookupResult, OnlineStore};
use crate::types::StoredFeature;
use crate::util::read_file_to_bytes;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use prost::Message;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::cluster::{ClusterClient, ClusterClientBuilder};
use redis::cluster_async::ClusterConnection;
use redis::{
    Client, ClientTlsConfig, ConnectionAddr, ConnectionInfo, IntoConnectionInfo,
    RedisConnectionInfo, RedisError, RedisResult, TlsCertificates,
};
use rustc_hash::FxHashMap as HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

/// Options parsed from a connection string like
/// `host1:6379,host2:6379,password=secret,ssl=true,db=0`.
#[derive(Debug, Default, Clone, PartialEq)]
struct RedisConnectionOptions {
    hosts: Vec<(String, u16)>,
    password: Option<String>,
    username: Option<String>,
    ssl: bool,
    db: Option<i64>,
    ssl_certfile: Option<String>,
    ssl_keyfile: Option<String>,
    ssl_ca_certs: Option<String>,
}

fn parse_bool_option(index: usize, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(anyhow!(
            "Invalid ssl value at index {}: {}, supported values are 'true', 'false', '1', '0', 'yes', 'no'",
            index,
            value
        )),
    }
}

impl RedisConnectionOptions {
    fn set_option(&mut self, index: usize, key: &str, value: &str) -> Result<()> {
        match key.to_ascii_lowercase().as_str() {
            "password" => self.password = Some(value.to_string()),
            "username" => self.username = Some(value.to_string()),
            "db" => {
                self.db = Some(
                    value
                        .parse::<i64>()
                        .with_context(|| format!("Invalid db at index {}: {}", index, value))?,
                )
            }
            "ssl" => self.ssl = parse_bool_option(index, value)?,
            "ssl_certfile" => self.ssl_certfile = Some(value.to_string()),
            "ssl_keyfile" => self.ssl_keyfile = Some(value.to_string()),
            "ssl_ca_certs" => self.ssl_ca_certs = Some(value.to_string()),
            other => {
                return Err(anyhow!(
                    "Invalid connection option at index {}: {}",
                    index,
                    other
                ));
            }
        }
        Ok(())
    }

    fn tls_certificates(&self) -> Result<TlsCertificates> {
        let client_tls = match (self.ssl_certfile.as_ref(), self.ssl_keyfile.as_ref()) {
            (Some(cert), Some(key)) => Some(ClientTlsConfig {
                client_cert: read_file_to_bytes(cert)?,
                client_key: read_file_to_bytes(key)?,
            }),
            (None, None) => None,
            _ => {
                return Err(anyhow!(
                    "Both ssl_keyfile and ssl_certfile must be provided together or neither"
                ));
            }
        };
        Ok(TlsCertificates {
            client_tls,
            root_cert: self
                .ssl_ca_certs
                .as_deref()
                .map(read_file_to_bytes)
                .transpose()?,
        })
    }

    fn single_node_address(&self) -> Result<ConnectionAddr> {
        match self.hosts.as_slice() {
            [(host, port)] => Ok(if self.ssl {
                ConnectionAddr::TcpTls {
                    host: host.clone(),
                    port: *port,
                    insecure: false,
                    tls_params: None,
                }
            } else {
                ConnectionAddr::Tcp(host.clone(), *port)
            }),
            hosts => Err(anyhow!(
                "Expected a single host for a single node Redis store, got {}",
                hosts.len()
            )),
        }
    }
}

impl FromStr for RedisConnectionOptions {
    type Err = anyhow::Error;

    fn from_str(connection_string: &str) -> Result<Self> {
        let mut options = RedisConnectionOptions::default();
        for (i, part) in connection_string.split(',').map(str::trim).enumerate() {
            if part.matches(':').count() == 1 {
                let (host, port) = part
                    .split_once(':')
                    .ok_or_else(|| anyhow!("Invalid host at index {}", i))?;
                let port = port
                    .parse::<u16>()
                    .with_context(|| format!("Failed to parse port '{}'", port))?;
                options.hosts.push((host.to_string(), port));
            } else if part.matches('=').count() == 1 {
                let (key, value) = part
                    .split_once('=')
                    .ok_or_else(|| anyhow!("Invalid connection option at index {}", i))?;
                options.set_option(i, key, value)?;
            } else {
                return Err(anyhow!(
                    "Invalid connection URL part at index {}: {}",
                    i,
                    part
                ));
            }
        }
        if options.hosts.is_empty() {
            return Err(anyhow!("Redis connection string does not name any host"));
        }
        Ok(options)
    }
}

struct RedisNode {
    addr: ConnectionAddr,
    redis: RedisConnectionInfo,
}

impl IntoConnectionInfo for RedisNode {
    fn into_connection_info(self) -> RedisResult<ConnectionInfo> {
        Ok(ConnectionInfo {
            addr: self.addr,
            redis: self.redis,
        })
    }
}

fn redis_info(options: &RedisConnectionOptions, with_credentials: bool) -> RedisConnectionInfo {
    let mut redis = RedisConnectionInfo::default();
    if with_credentials {
        redis.username = options.username.clone();
        redis.password = options.password.clone();
    }
    if let Some(db) = options.db {
        redis.db = db;
    }
    redis
}

fn cluster_client(options: &RedisConnectionOptions) -> Result<ClusterClient> {
    let nodes: Vec<RedisNode> = options
        .hosts
        .iter()
        .map(|(host, port)| RedisNode {
            addr: ConnectionAddr::Tcp(host.clone(), *port),
            redis: redis_info(options, false),
        })
        .collect();
    let mut builder = ClusterClientBuilder::new(nodes);
    if options.ssl {
        builder = builder.certs(options.tls_certificates()?);
    }
    if let Some(username) = &options.username {
        builder = builder.username(username.clone());
    }
    if let Some(password) = &options.password {
        builder = builder.password(password.clone());
    }
    Ok(builder.build()?)
}

fn classify(err: RedisError) -> LookupError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        LookupError::Unavailable(err.to_string())
    } else {
        LookupError::Failed(err.to_string())
    }
}

fn decode(bytes: Option<Vec<u8>>) -> LookupResult {
    bytes
        .map(|bytes| {
            StoredFeature::decode(bytes.as_slice())
                .map_err(|e| LookupError::Failed(format!("Failed to decode stored feature: {}", e)))
        })
        .transpose()
}

trait GetConnection {
    fn get_connection(&self) -> impl ConnectionLike + Send + Sync;
}

pub(crate) struct RedisSingleNodeOnlineStore {
    connection_pool: ConnectionManager,
}

impl GetConnection for RedisSingleNodeOnlineStore {
    fn get_connection(&self) -> impl ConnectionLike + Send + Sync {
        self.connection_pool.clone()
    }
}

pub(crate) struct RedisClusterOnlineStore {
    connection_pool: ClusterConnection,
}

impl GetConnection for RedisClusterOnlineStore {
    fn get_connection(&self) -> impl ConnectionLike + Send + Sync {
        self.connection_pool.clone()
    }
}

async fn check_redis_connection(client: &Client) -> Result<()> {
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .context("Cannot establish redis connection")?;
    let ping_response: String = redis::cmd("PING").query_async(&mut conn).await?;
    if !ping_response.eq_ignore_ascii_case("PONG") {
        return Err(anyhow!(
            "Failed to connect to Redis online store, unexpected PING response: {}",
            ping_response
        ));
    }
    Ok(())
}

pub async fn new(redis_type: RedisType, connection_string: String) -> Result<Arc<dyn OnlineStore>> {
    let options: RedisConnectionOptions = connection_string.parse()?;
    match redis_type {
        RedisType::SingleNode => {
            let node = RedisNode {
                addr: options.single_node_address()?,
                redis: redis_info(&options, true),
            };
            let client = if options.ssl {
                Client::build_with_tls(node, options.tls_certificates()?)?
            } else {
                Client::open(node)?
            };
            check_redis_connection(&client).await?;
            let connection_pool = ConnectionManager::new(client).await?;
            Ok(Arc::new(RedisSingleNodeOnlineStore { connection_pool }))
        }
        RedisType::RedisCluster => {
            let connection_pool = cluster_client(&options)?
                .get_async_connection()
                .await
                .context("Cannot establish redis cluster connection")?;
            Ok(Arc::new(RedisClusterOnlineStore { connection_pool }))
        }
    }
}

#[async_trait]
impl<T> OnlineStore for T
where
    T: GetConnection + Send + Sync + 'static,
{
    async fn get(&self, key: &LookupKey) -> LookupResult {
        let mut connection = self.get_connection();
        let bytes: Option<Vec<u8>> = redis::cmd("HGET")
            .arg(&key.entity_key)
            .arg(&key.field)
            .query_async(&mut connection)
            .await
            .map_err(classify)?;
        decode(bytes)
    }

    /// One HMGET per distinct entity key, all sent in a single pipeline.
    async fn multi_get(
        &self,
        keys: &[LookupKey],
    ) -> std::result::Result<Vec<LookupResult>, LookupError> {
        let mut groups: Vec<(&[u8], Vec<usize>)> = vec![];
        let mut group_index: HashMap<&[u8], usize> = HashMap::default();
        for (i, key) in keys.iter().enumerate() {
            let group = *group_index
                .entry(key.entity_key.as_slice())
                .or_insert_with(|| {
                    groups.push((key.entity_key.as_slice(), vec![]));
                    groups.len() - 1
                });
            groups[group].1.push(i);
        }

        let mut pipeline = redis::pipe();
        for (entity_key, members) in &groups {
            let fields: Vec<Vec<u8>> = members.iter().map(|&i| keys[i].field.clone()).collect();
            pipeline.cmd("HMGET").arg(*entity_key).arg(fields);
        }

        let mut connection = self.get_connection();
        let replies: Vec<Vec<Option<Vec<u8>>>> = pipeline
            .query_async(&mut connection)
            .await
            .map_err(classify)?;
        if replies.len() != groups.len() {
            return Err(LookupError::Failed(format!(
                "Mismatched number of HMGET replies: expected {}, got {}",
                groups.len(),
                replies.len()
            )));
        }

        let mut results: Vec<LookupResult> = vec![Ok(None); keys.len()];
        for ((_, members), reply) in groups.iter().zip(replies) {
            if reply.len() != members.len() {
                warn!(
                    expected = members.len(),
                    got = reply.len(),
                    "Mismatched HMGET reply length"
                );
                for &i in members {
                    results[i] = Err(LookupError::Failed("Mismatched HMGET reply".to_string()));
                }
                continue;
            }
            for (&i, bytes) in members.iter().zip(reply) {
                results[i] = decode(bytes);
            }
        }
        Ok(results)
    }

    fn supports_multi_get(&self) -> bool {
        true
    }
}
