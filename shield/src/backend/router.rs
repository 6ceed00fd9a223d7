use crate::backend::interceptor::{dispatch, expect_reply};
use crate::backend::{Backend, Command, Exist, Expiry, Interceptor, Reply, Request};
use crate::error::{Error, Result};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};

pub(crate) struct Route {
  pub(crate) prefix: String,
  pub(crate) backend: Arc<dyn Backend>,
}

/// Routes keys to backends by longest matching prefix and runs every command
/// through the interceptor chain.
pub(crate) struct Router {
  /// Sorted by descending prefix length.
  routes: Arc<[Route]>,
  interceptors: Arc<[Arc<dyn Interceptor>]>,
}

impl Router {
  pub(crate) fn new(mut routes: Vec<Route>, interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
    routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
    Self {
      routes: routes.into(),
      interceptors: interceptors.into(),
    }
  }

  fn route_index(&self, key: &str) -> Result<usize> {
    self
      .routes
      .iter()
      .position(|route| key.starts_with(&route.prefix))
      .ok_or_else(|| Error::NotConfigured {
        key: key.to_string(),
      })
  }

  /// Name of the backend serving `key`.
  pub(crate) fn backend_name(&self, key: &str) -> String {
    self
      .route_index(key)
      .map(|index| self.routes[index].backend.name().to_string())
      .unwrap_or_default()
  }

  async fn call(&self, index: usize, request: Request) -> Result<Reply> {
    dispatch(&*self.routes[index].backend, &self.interceptors, request).await
  }

  async fn call_for(&self, key: &str, request: Request) -> Result<Reply> {
    let index = self.route_index(key)?;
    self.call(index, request).await
  }

  /// Splits `keys` by route, keeping each key's original position.
  fn group<'k, I>(&self, keys: I) -> Result<Vec<(usize, Vec<usize>)>>
  where
    I: IntoIterator<Item = &'k str>,
  {
    let mut groups: Vec<(usize, Vec<usize>)> = Vec::new();
    for (position, key) in keys.into_iter().enumerate() {
      let index = self.route_index(key)?;
      match groups.iter_mut().find(|(route, _)| *route == index) {
        Some((_, positions)) => positions.push(position),
        None => groups.push((index, vec![position])),
      }
    }
    Ok(groups)
  }
}

fn expect_unit(reply: Reply, command: Command) -> Result<()> {
  match reply {
    Reply::Unit => Ok(()),
    _ => Err(Error::UnexpectedReply(format!("{:?}", command))),
  }
}

#[async_trait]
impl Backend for Router {
  fn name(&self) -> &str {
    self
      .routes
      .last()
      .map(|route| route.backend.name())
      .unwrap_or("router")
  }

  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let reply = self.call_for(key, Request::Get { key: key.to_string() }).await?;
    expect_reply!(reply, Value, Command::Get)
  }

  async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
    let mut values = vec![None; keys.len()];
    for (index, positions) in self.group(keys.iter().map(String::as_str))? {
      let batch: Vec<String> = positions.iter().map(|&p| keys[p].clone()).collect();
      let reply = self.call(index, Request::GetMany { keys: batch }).await?;
      let found = expect_reply!(reply, Values, Command::GetMany)?;
      for (position, value) in positions.into_iter().zip(found) {
        values[position] = value;
      }
    }
    Ok(values)
  }

  async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>, exist: Exist) -> Result<bool> {
    let request = Request::Set {
      key: key.to_string(),
      value,
      ttl,
      exist,
    };
    let reply = self.call_for(key, request).await?;
    expect_reply!(reply, Bool, Command::Set)
  }

  async fn set_many(&self, pairs: Vec<(String, Vec<u8>)>, ttl: Option<Duration>) -> Result<()> {
    let groups = self.group(pairs.iter().map(|(k, _)| k.as_str()))?;
    let mut slots: Vec<Option<(String, Vec<u8>)>> = pairs.into_iter().map(Some).collect();
    for (index, positions) in groups {
      let batch = positions.iter().filter_map(|&p| slots[p].take()).collect();
      let reply = self.call(index, Request::SetMany { pairs: batch, ttl }).await?;
      expect_unit(reply, Command::SetMany)?;
    }
    Ok(())
  }

  async fn incr(&self, key: &str, by: i64, ttl: Option<Duration>) -> Result<i64> {
    let request = Request::Incr {
      key: key.to_string(),
      by,
      ttl,
    };
    let reply = self.call_for(key, request).await?;
    expect_reply!(reply, Int, Command::Incr)
  }

  async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
    let request = Request::Expire {
      key: key.to_string(),
      ttl,
    };
    let reply = self.call_for(key, request).await?;
    expect_reply!(reply, Bool, Command::Expire)
  }

  async fn get_expire(&self, key: &str) -> Result<Expiry> {
    let reply = self
      .call_for(key, Request::GetExpire { key: key.to_string() })
      .await?;
    expect_reply!(reply, Expiry, Command::GetExpire)
  }

  async fn delete(&self, key: &str) -> Result<bool> {
    let reply = self.call_for(key, Request::Delete { key: key.to_string() }).await?;
    expect_reply!(reply, Bool, Command::Delete)
  }

  async fn delete_many(&self, keys: &[String]) -> Result<u64> {
    let mut removed = 0;
    for (index, positions) in self.group(keys.iter().map(String::as_str))? {
      let batch = positions.iter().map(|&p| keys[p].clone()).collect();
      let reply = self.call(index, Request::DeleteMany { keys: batch }).await?;
      removed += expect_reply!(reply, Count, Command::DeleteMany)?;
    }
    Ok(removed)
  }

  async fn delete_match(&self, pattern: &str) -> Result<u64> {
    let mut removed = 0;
    for index in 0..self.routes.len() {
      let request = Request::DeleteMatch {
        pattern: pattern.to_string(),
      };
      let reply = self.call(index, request).await?;
      removed += expect_reply!(reply, Count, Command::DeleteMatch)?;
    }
    Ok(removed)
  }

  fn scan(&self, pattern: &str) -> BoxStream<'static, Result<String>> {
    let routes = self.routes.clone();
    let interceptors = self.interceptors.clone();
    let pattern = pattern.to_string();
    stream::iter(0..routes.len())
      .then(move |index| {
        let routes = routes.clone();
        let interceptors = interceptors.clone();
        let request = Request::Scan {
          pattern: pattern.clone(),
        };
        async move { dispatch(&*routes[index].backend, &interceptors, request).await }
      })
      .flat_map(|reply| match reply {
        Ok(Reply::Keys(keys)) => keys,
        Ok(_) => stream::once(async { Err(Error::UnexpectedReply(format!("{:?}", Command::Scan))) }).boxed(),
        Err(e) => stream::once(async move { Err(e) }).boxed(),
      })
      .boxed()
  }

  async fn exists(&self, key: &str) -> Result<bool> {
    let reply = self.call_for(key, Request::Exists { key: key.to_string() }).await?;
    expect_reply!(reply, Bool, Command::Exists)
  }

  async fn get_keys_count(&self) -> Result<u64> {
    let mut total = 0;
    for index in 0..self.routes.len() {
      let reply = self.call(index, Request::GetKeysCount).await?;
      total += expect_reply!(reply, Count, Command::GetKeysCount)?;
    }
    Ok(total)
  }

  async fn ping(&self, message: Option<&str>) -> Result<String> {
    let mut answer = None;
    for index in 0..self.routes.len() {
      let request = Request::Ping {
        message: message.map(str::to_string),
      };
      let reply = self.call(index, request).await?;
      let text = expect_reply!(reply, Text, Command::Ping)?;
      answer.get_or_insert(text);
    }
    Ok(answer.unwrap_or_else(|| "PONG".to_string()))
  }

  async fn clear(&self) -> Result<()> {
    for index in 0..self.routes.len() {
      let reply = self.call(index, Request::Clear).await?;
      expect_unit(reply, Command::Clear)?;
    }
    Ok(())
  }

  async fn close(&self) -> Result<()> {
    for index in 0..self.routes.len() {
      let reply = self.call(index, Request::Close).await?;
      expect_unit(reply, Command::Close)?;
    }
    Ok(())
  }

  async fn delete_if_eq(&self, key: &str, value: &[u8]) -> Result<bool> {
    let request = Request::DeleteIfEq {
      key: key.to_string(),
      value: value.to_vec(),
    };
    let reply = self.call_for(key, request).await?;
    expect_reply!(reply, Bool, Command::DeleteIfEq)
  }

  async fn set_add(&self, key: &str, members: &[String], ttl: Option<Duration>) -> Result<u64> {
    let request = Request::SetAdd {
      key: key.to_string(),
      members: members.to_vec(),
      ttl,
    };
    let reply = self.call_for(key, request).await?;
    expect_reply!(reply, Count, Command::SetAdd)
  }

  async fn set_remove(&self, key: &str, members: &[String]) -> Result<u64> {
    let request = Request::SetRemove {
      key: key.to_string(),
      members: members.to_vec(),
    };
    let reply = self.call_for(key, request).await?;
    expect_reply!(reply, Count, Command::SetRemove)
  }

  async fn set_pop(&self, key: &str, count: usize) -> Result<Vec<String>> {
    let request = Request::SetPop {
      key: key.to_string(),
      count,
    };
    let reply = self.call_for(key, request).await?;
    expect_reply!(reply, Members, Command::SetPop)
  }

  async fn get_bits(&self, key: &str, indexes: &[u64]) -> Result<Vec<bool>> {
    let request = Request::GetBits {
      key: key.to_string(),
      indexes: indexes.to_vec(),
    };
    let reply = self.call_for(key, request).await?;
    expect_reply!(reply, Bits, Command::GetBits)
  }

  async fn set_bits(&self, key: &str, indexes: &[u64], ttl: Option<Duration>) -> Result<()> {
    let request = Request::SetBits {
      key: key.to_string(),
      indexes: indexes.to_vec(),
      ttl,
    };
    let reply = self.call_for(key, request).await?;
    expect_unit(reply, Command::SetBits)
  }

  async fn get_match(&self, pattern: &str) -> Result<Vec<(String, Vec<u8>)>> {
    let mut pairs = Vec::new();
    for index in 0..self.routes.len() {
      let request = Request::GetMatch {
        pattern: pattern.to_string(),
      };
      let reply = self.call(index, request).await?;
      pairs.extend(expect_reply!(reply, Pairs, Command::GetMatch)?);
    }
    Ok(pairs)
  }
}
