//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: Clock の時刻 + 乱数で ULID を作る

use crate::domain::ids::{ObserverId, OperationId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は実行時 ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（ChangeBus / RefreshScope から共有される）
pub trait IdGenerator: Send + Sync {
    /// 変更通知の購読 ID を生成
    fn generate_observer_id(&self) -> ObserverId;

    /// 共有リフレッシュ操作の ID を生成
    fn generate_operation_id(&self) -> OperationId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// FixedClock を渡せばタイムスタンプ部分が固定される（ランダム部分は毎回異なる）。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_observer_id(&self) -> ObserverId {
        ObserverId::from(self.next_ulid())
    }

    fn generate_operation_id(&self) -> OperationId {
        OperationId::from(self.next_ulid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.generate_operation_id();
        let id2 = id_gen.generate_operation_id();

        assert_ne!(id1, id2);
    }

    #[test]
    fn ulid_generator_with_fixed_clock_shares_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let id1 = id_gen.generate_observer_id();
        let id2 = id_gen.generate_observer_id();

        // ランダム部分があるので ID は異なる
        assert_ne!(id1, id2);

        assert_eq!(id1.as_ulid().timestamp_ms(), id2.as_ulid().timestamp_ms());
        assert_eq!(id1.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
    }

    #[test]
    fn different_id_types_have_different_prefixes() {
        let id_gen = UlidGenerator::new(SystemClock);

        assert!(id_gen.generate_observer_id().to_string().starts_with("observer-"));
        assert!(id_gen.generate_operation_id().to_string().starts_with("op-"));
    }
}
