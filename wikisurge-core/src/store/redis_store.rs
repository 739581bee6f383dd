use crate::error::Result;
use crate::keys::Keys;
use crate::store::{Store, StreamEntry, WarAppend, WindowAppend};
use async_trait::async_trait;
use redis::streams::{StreamMaxlen, StreamRangeReply};
use redis::{AsyncCommands, aio::ConnectionManager};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::info;

/// Redis-backed store.
///
/// One [`ConnectionManager`] shared by every component; it multiplexes and
/// reconnects internally. Compound updates run as `MULTI`/`EXEC` pipelines
/// so a single edit's bookkeeping is atomic at the storage layer.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    (ttl.as_secs().max(1)) as i64
}

impl RedisStore {
    pub async fn new(redis_url: &str) -> Result<Self> {
        info!("Connecting to Redis at {}", redis_url);

        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;

        info!("Successfully connected to Redis");

        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.conn().get(key).await?)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        Ok(self.conn().incr(key, 1).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let _: bool = self.conn().expire(key, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut self.conn())
            .await?;
        Ok(reply.is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.conn().exists(key).await?)
    }

    async fn del(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let _: () = self.conn().del(keys).await?;
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let _: () = self.conn().zadd(key, member, score).await?;
        Ok(())
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        Ok(self.conn().zcard(key).await?)
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        Ok(self.conn().zcount(key, min, max).await?)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        Ok(self.conn().zscore(key, member).await?)
    }

    async fn zrevrank(&self, key: &str, member: &str) -> Result<Option<u64>> {
        let rank: Option<u64> = redis::cmd("ZREVRANK")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn())
            .await?;
        Ok(rank)
    }

    async fn zrevrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        Ok(self.conn().zrevrange_withscores(key, start, stop).await?)
    }

    async fn zrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        Ok(self.conn().zrange_withscores(key, start, stop).await?)
    }

    async fn zrem(&self, key: &str, members: &[String]) -> Result<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        Ok(self.conn().zrem(key, members).await?)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.conn().hget(key, field).await?)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.conn().hgetall(key).await?)
    }

    async fn hlen(&self, key: &str) -> Result<u64> {
        Ok(self.conn().hlen(key).await?)
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let _: () = self.conn().hdel(key, fields).await?;
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        Ok(self.conn().lrange(key, start, stop).await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let added: i64 = self.conn().sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let removed: i64 = self.conn().srem(key, member).await?;
        Ok(removed > 0)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self.conn().sismember(key, member).await?)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.conn().smembers(key).await?)
    }

    async fn xadd_capped(
        &self,
        stream: &str,
        fields: &[(String, String)],
        maxlen: u64,
    ) -> Result<String> {
        let id: String = self
            .conn()
            .xadd_maxlen(stream, StreamMaxlen::Approx(maxlen as usize), "*", fields)
            .await?;
        Ok(id)
    }

    async fn xrange_after(
        &self,
        stream: &str,
        after: Option<&str>,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        // '(' makes the lower bound exclusive, so the cursor entry itself is
        // not redelivered.
        let start = match after {
            Some(id) => format!("({id}"),
            None => "-".to_string(),
        };
        let reply: StreamRangeReply = redis::cmd("XRANGE")
            .arg(stream)
            .arg(start)
            .arg("+")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut self.conn())
            .await?;
        Ok(convert_entries(reply))
    }

    async fn xrevrange_count(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>> {
        let reply: StreamRangeReply = self.conn().xrevrange_count(stream, "+", "-", count).await?;
        Ok(convert_entries(reply))
    }

    async fn xlen(&self, stream: &str) -> Result<u64> {
        Ok(self.conn().xlen(stream).await?)
    }

    async fn xlast_id(&self, stream: &str) -> Result<Option<String>> {
        let reply: StreamRangeReply = self.conn().xrevrange_count(stream, "+", "-", 1).await?;
        Ok(reply.ids.into_iter().next().map(|entry| entry.id))
    }

    async fn window_append(&self, req: WindowAppend<'_>) -> Result<()> {
        let watermark = req.timestamp - req.window.as_secs() as i64;
        let keep_from = -(req.max_members as isize) - 1;
        let ttl = ttl_secs(req.ttl);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .zadd(req.window_key, req.member, req.timestamp)
            .ignore()
            .zadd(req.registry_key, req.page, req.timestamp)
            .ignore()
            .cmd("ZREMRANGEBYSCORE")
            .arg(req.window_key)
            .arg("-inf")
            .arg(watermark)
            .ignore()
            .cmd("ZREMRANGEBYRANK")
            .arg(req.window_key)
            .arg(0)
            .arg(keep_from)
            .ignore()
            .cmd("EXPIRE")
            .arg(req.window_key)
            .arg(ttl)
            .ignore()
            .hset(req.meta_key, "last_edit_ts", req.timestamp)
            .ignore()
            .hincr(req.meta_key, "edit_count", 1)
            .ignore()
            .cmd("EXPIRE")
            .arg(req.meta_key)
            .arg(ttl)
            .ignore()
            .hincr(req.editors_key, req.editor, 1)
            .ignore()
            .cmd("EXPIRE")
            .arg(req.editors_key)
            .arg(ttl)
            .ignore()
            .lpush(req.changes_key, req.byte_delta)
            .ignore()
            .ltrim(req.changes_key, 0, req.changes_cap as isize - 1)
            .ignore()
            .cmd("EXPIRE")
            .arg(req.changes_key)
            .arg(ttl)
            .ignore();

        let _: () = pipe.query_async(&mut self.conn()).await?;
        Ok(())
    }

    async fn war_append(&self, req: WarAppend<'_>) -> Result<()> {
        let ttl = ttl_secs(req.ttl);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hincr(req.editors_key, req.editor, 1)
            .ignore()
            .cmd("EXPIRE")
            .arg(req.editors_key)
            .arg(ttl)
            .ignore()
            .lpush(req.changes_key, req.byte_delta)
            .ignore()
            .ltrim(req.changes_key, 0, req.changes_cap as isize - 1)
            .ignore()
            .cmd("EXPIRE")
            .arg(req.changes_key)
            .arg(ttl)
            .ignore();
        let _: () = pipe.query_async(&mut self.conn()).await?;
        Ok(())
    }

    async fn trending_store(&self, page: &str, score: f64, now: i64) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zadd(Keys::trending_global(), page, score)
            .ignore()
            .hset(Keys::trending_updated(), page, now)
            .ignore();
        let _: () = pipe.query_async(&mut self.conn()).await?;
        Ok(())
    }
}

fn convert_entries(reply: StreamRangeReply) -> Vec<StreamEntry> {
    reply
        .ids
        .into_iter()
        .map(|entry| {
            let mut fields: Vec<(String, String)> = entry
                .map
                .iter()
                .filter_map(|(k, v)| {
                    redis::from_redis_value::<String>(v.clone())
                        .ok()
                        .map(|v| (k.clone(), v))
                })
                .collect();
            fields.sort();
            StreamEntry {
                id: entry.id,
                fields,
            }
        })
        .collect()
}
