//! リフレッシュの結果

use super::change::Commit;
use super::errors::SyncError;
use super::page::PageToken;

/// 1 回の refresh / next_page がどう終わったか
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// リモートから取得して書き込んだ
    Fetched {
        saved: usize,
        removed: usize,
        next_page: Option<PageToken>,
        changes: Commit,
    },
    /// キャッシュがまだ新しいのでネットワークに出なかった
    Fresh,
    /// オフラインモードのためローカルデータのみ
    Offline,
    /// リモートを持たない UseCase をローカルに書き込んだ
    Local { changes: Commit },
    /// 次のページがない
    Exhausted,
}

impl RefreshOutcome {
    pub fn hit_network(&self) -> bool {
        matches!(self, RefreshOutcome::Fetched { .. })
    }

    pub fn changes(&self) -> Option<&Commit> {
        match self {
            RefreshOutcome::Fetched { changes, .. } | RefreshOutcome::Local { changes } => {
                Some(changes)
            }
            _ => None,
        }
    }

    pub fn next_page(&self) -> Option<&PageToken> {
        match self {
            RefreshOutcome::Fetched { next_page, .. } => next_page.as_ref(),
            _ => None,
        }
    }
}

pub type RefreshResult = Result<RefreshOutcome, SyncError>;
