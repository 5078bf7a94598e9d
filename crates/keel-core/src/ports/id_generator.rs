//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース。Clock の時刻を timestamp 部分に使う

use std::sync::Mutex;

use ulid::Ulid;

use crate::domain::{PointId, RunId};
use crate::ports::Clock;

/// IdGenerator は時刻順に並ぶ ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数スレッドから使える）
pub trait IdGenerator: Send + Sync {
    fn generate_run_id(&self) -> RunId;

    /// Point ID は生成順に厳密に単調増加する
    fn generate_point_id(&self) -> PointId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// 同じミリ秒内（または時計が戻った場合）は直前の ULID を increment して
/// 単調性を保つ。recovery point の「最新」を ID の比較だけで決めるため。
pub struct UlidGenerator<C> {
    clock: C,
    last: Mutex<Option<Ulid>>,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            last: Mutex::new(None),
        }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        let fresh = Ulid::from_parts(timestamp_ms, rand::random());

        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = match *last {
            Some(prev) if fresh <= prev => prev.increment().unwrap_or(fresh),
            _ => fresh,
        };
        *last = Some(next);
        next
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_run_id(&self) -> RunId {
        RunId::from(self.next_ulid())
    }

    fn generate_point_id(&self) -> PointId {
        PointId::from(self.next_ulid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, ManualClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.generate_point_id();
        let id2 = id_gen.generate_point_id();
        let id3 = id_gen.generate_point_id();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn point_ids_are_strictly_increasing_within_one_millisecond() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let ids: Vec<PointId> = (0..50).map(|_| id_gen.generate_point_id()).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        // timestamp 部分は FixedClock の時刻
        assert_eq!(ids[0].timestamp_ms(), fixed_time.timestamp_millis() as u64);
    }

    #[test]
    fn clock_going_backwards_keeps_order() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(std::time::Duration::from_secs(10));
        let id_gen = UlidGenerator::new(clock);

        let first = id_gen.generate_point_id();
        id_gen.clock.set(start);
        let second = id_gen.generate_point_id();
        assert!(first < second);
    }

    #[test]
    fn run_and_point_ids_have_distinct_prefixes() {
        let id_gen = UlidGenerator::new(SystemClock);
        assert!(id_gen.generate_run_id().to_string().starts_with("run-"));
        assert!(id_gen.generate_point_id().to_string().starts_with("rp-"));
    }
}
