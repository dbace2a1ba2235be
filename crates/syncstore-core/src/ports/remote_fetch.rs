//! RemoteFetch port - バックエンドへのリクエスト実行
//!
//! トランスポート（HTTP ヘッダ、multipart など）はここでは扱わない。
//! コアが知っているのは「何を取りに行くか」の記述と、デコード前の JSON 本体だけ。
//!
//! キャンセルは future を drop することで行う。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::domain::{FetchError, PageToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// 取得内容の記述（UseCase のコンストラクタ引数から決まる）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub method: Method,
    pub path: String,
    #[serde(default)]
    pub query: Vec<(String, String)>,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)?;
        for (i, (key, value)) in self.query.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{sep}{key}={value}")?;
        }
        Ok(())
    }
}

/// レスポンス本体 + 次ページのトークン
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePayload {
    pub body: Value,
    pub next_page: Option<PageToken>,
}

impl RemotePayload {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            next_page: None,
        }
    }

    pub fn with_next_page(mut self, token: impl Into<PageToken>) -> Self {
        self.next_page = Some(token.into());
        self
    }
}

/// RemoteFetch はリクエストを実行して JSON 本体か型付きの失敗を返す
#[async_trait::async_trait]
pub trait RemoteFetch: Send + Sync {
    /// `page` が Some なら、前回のレスポンスが返したトークンで続きを取得する
    async fn execute(
        &self,
        request: &RequestDescriptor,
        page: Option<&PageToken>,
    ) -> Result<RemotePayload, FetchError>;
}
