use std::{collections::BTreeMap, future::Future, net::SocketAddr, pin::Pin, time::Duration};

use tonic::transport::{Channel, Endpoint};

use crate::engine::proto::xray::app::stats::command::{
    GetStatsRequest, QueryStatsRequest, stats_service_client::StatsServiceClient,
};

const USER_PREFIX: &str = "user>>>";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum StatsError {
    Transport(tonic::transport::Error),
    Status(tonic::Status),
}

impl std::fmt::Display for StatsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "stats api transport error: {err}"),
            Self::Status(status) => write!(
                f,
                "stats api error: {:?} {}",
                status.code(),
                status.message()
            ),
        }
    }
}

impl std::error::Error for StatsError {}

impl From<tonic::transport::Error> for StatsError {
    fn from(value: tonic::transport::Error) -> Self {
        Self::Transport(value)
    }
}

impl From<tonic::Status> for StatsError {
    fn from(value: tonic::Status) -> Self {
        Self::Status(value)
    }
}

/// Cumulative byte counters of one stats tag since the engine instance started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatReading {
    pub uplink: u64,
    pub downlink: u64,
}

pub type TrafficFuture<'a> =
    Pin<Box<dyn Future<Output = Result<BTreeMap<String, StatReading>, StatsError>> + Send + 'a>>;
pub type OnlineFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<u32>, StatsError>> + Send + 'a>>;

/// What the poller needs from the engine's statistics interface.
pub trait EngineStats: Send + Sync {
    /// All per-user traffic counters in one round trip, keyed by stats tag.
    fn query_traffic(&self) -> TrafficFuture<'_>;
    /// Distinct source addresses currently online for `tag`; `None` when the engine
    /// does not track them.
    fn online_ips<'a>(&'a self, tag: &'a str) -> OnlineFuture<'a>;
}

/// Xray `StatsService` over gRPC. Connects lazily so the engine may come up later.
#[derive(Debug, Clone)]
pub struct GrpcStats {
    stats: StatsServiceClient<Channel>,
}

impl GrpcStats {
    pub fn new(addr: SocketAddr) -> Result<Self, StatsError> {
        let endpoint = Endpoint::from_shared(format!("http://{addr}"))?
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT);
        let channel = endpoint.connect_lazy();
        Ok(Self {
            stats: StatsServiceClient::new(channel),
        })
    }
}

impl EngineStats for GrpcStats {
    fn query_traffic(&self) -> TrafficFuture<'_> {
        let mut client = self.stats.clone();
        Box::pin(async move {
            let resp = client
                .query_stats(QueryStatsRequest {
                    pattern: USER_PREFIX.to_string(),
                    reset: false,
                })
                .await?
                .into_inner();

            let mut out: BTreeMap<String, StatReading> = BTreeMap::new();
            for stat in resp.stat {
                let Some((tag, direction)) = parse_user_traffic_name(&stat.name) else {
                    continue;
                };
                let value = u64::try_from(stat.value).unwrap_or(0);
                let reading = out.entry(tag.to_string()).or_default();
                match direction {
                    Direction::Uplink => reading.uplink = value,
                    Direction::Downlink => reading.downlink = value,
                }
            }
            Ok(out)
        })
    }

    fn online_ips<'a>(&'a self, tag: &'a str) -> OnlineFuture<'a> {
        let mut client = self.stats.clone();
        Box::pin(async move {
            let req = GetStatsRequest {
                name: format!("{USER_PREFIX}{tag}>>>online"),
                reset: false,
            };
            match client.get_stats_online_ip_list(req).await {
                Ok(resp) => Ok(Some(resp.into_inner().ips.len() as u32)),
                // Older engines lack the rpc; a user without sessions has no counter yet.
                Err(status) if status.code() == tonic::Code::Unimplemented => Ok(None),
                Err(status) if is_not_found(&status) => Ok(Some(0)),
                Err(status) => Err(status.into()),
            }
        })
    }
}

fn is_not_found(status: &tonic::Status) -> bool {
    // Xray reports missing counters as `Unknown` with the reason in the message.
    status.code() == tonic::Code::NotFound
        || status.message().to_ascii_lowercase().contains("not found")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Uplink,
    Downlink,
}

/// `user>>>{tag}>>>traffic>>>uplink` → (`tag`, uplink)
fn parse_user_traffic_name(name: &str) -> Option<(&str, Direction)> {
    let rest = name.strip_prefix(USER_PREFIX)?;
    let (tag, direction) = rest.rsplit_once(">>>traffic>>>")?;
    let direction = match direction {
        "uplink" => Direction::Uplink,
        "downlink" => Direction::Downlink,
        _ => return None,
    };
    if tag.is_empty() {
        return None;
    }
    Some((tag, direction))
}
