//! スケジューラ統合テスト
//!
//! 遅延をばらつかせたワーカー実行でも、解放が常に提出順であることを
//! パイプライン外部から検証する。

use framesmith::application::FrameScheduler;
use framesmith::domain::{
    config::TransformSnapshot,
    error::{PipelineError, PipelineResult},
    ports::TransformPort,
    types::{Frame, ProcessedFrame},
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// seqごとに決められた遅延の後で入力をそのまま返すモック変換
struct DelayedTransform {
    delays_ms: Vec<u64>,
}

impl TransformPort for DelayedTransform {
    fn process(
        &self,
        frame: &Frame,
        prev: &Frame,
        _snapshot: &TransformSnapshot,
    ) -> PipelineResult<ProcessedFrame> {
        let index = (frame.seq as usize).saturating_sub(1) % self.delays_ms.len();
        std::thread::sleep(Duration::from_millis(self.delays_ms[index]));
        Ok(ProcessedFrame {
            output: frame.clone(),
            prev: prev.clone(),
            match_view: None,
        })
    }
}

/// 指定seqでパニックするモック変換
struct PanicOnSeq {
    seq: u64,
    processed: AtomicUsize,
}

impl TransformPort for PanicOnSeq {
    fn process(
        &self,
        frame: &Frame,
        prev: &Frame,
        _snapshot: &TransformSnapshot,
    ) -> PipelineResult<ProcessedFrame> {
        self.processed.fetch_add(1, Ordering::SeqCst);
        if frame.seq == self.seq {
            panic!("synthetic worker failure");
        }
        Ok(ProcessedFrame {
            output: frame.clone(),
            prev: prev.clone(),
            match_view: None,
        })
    }
}

/// キャプチャループと同じ形でtotal枚を流し、解放seq列と最大同時実行数を返す
fn drive<P: TransformPort + 'static>(
    scheduler: &mut FrameScheduler<P>,
    total: u64,
) -> (Vec<u64>, usize) {
    let mut released = Vec::new();
    let mut failed = 0u64;
    let mut max_in_flight = 0;
    let mut next_seq = 1u64;
    let prev = Frame::filled(0, 4, 4, [0, 0, 0]);

    let deadline = Instant::now() + Duration::from_secs(10);
    while (released.len() as u64) + failed < total {
        assert!(Instant::now() < deadline, "scheduler stalled");

        while let Some(outcome) = scheduler.next_ready() {
            match outcome.result {
                Ok(processed) => released.push(processed.output.seq),
                Err(_) => failed += 1,
            }
        }

        if next_seq <= total && scheduler.has_capacity() {
            let frame = Frame::filled(next_seq, 4, 4, [0, 0, 0]);
            scheduler
                .submit(frame, prev.clone(), TransformSnapshot::all_disabled(), Instant::now())
                .expect("submit within capacity");
            next_seq += 1;
            max_in_flight = max_in_flight.max(scheduler.in_flight());
        }

        std::thread::sleep(Duration::from_millis(1));
    }

    (released, max_in_flight)
}

#[test]
fn test_fifo_release_with_randomized_delays() {
    // プール4で8フレーム、遅延はばらばら
    let transform = Arc::new(DelayedTransform {
        delays_ms: vec![50, 10, 40, 5, 30, 20, 25, 15],
    });
    let mut scheduler = FrameScheduler::new(transform, 4, true);

    let (released, max_in_flight) = drive(&mut scheduler, 8);

    assert_eq!(released, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    assert!(max_in_flight <= 4, "in-flight exceeded pool size: {}", max_in_flight);
}

#[test]
fn test_sequential_mode_preserves_order() {
    let transform = Arc::new(DelayedTransform {
        delays_ms: vec![5, 1, 3],
    });
    let mut scheduler = FrameScheduler::new(transform, 4, false);

    let (released, max_in_flight) = drive(&mut scheduler, 6);

    assert_eq!(released, vec![1, 2, 3, 4, 5, 6]);
    // 逐次モードでは解放前に完了しているため滞留は1以下
    assert!(max_in_flight <= 1);
}

#[test]
fn test_submit_is_refused_when_pool_is_full() {
    let transform = Arc::new(DelayedTransform {
        delays_ms: vec![100],
    });
    let mut scheduler = FrameScheduler::new(transform, 2, true);
    let prev = Frame::filled(0, 4, 4, [0, 0, 0]);

    for seq in 1..=2 {
        scheduler
            .submit(
                Frame::filled(seq, 4, 4, [0, 0, 0]),
                prev.clone(),
                TransformSnapshot::all_disabled(),
                Instant::now(),
            )
            .expect("submit within capacity");
    }

    assert!(!scheduler.has_capacity());
    let refused = scheduler.submit(
        Frame::filled(3, 4, 4, [0, 0, 0]),
        prev.clone(),
        TransformSnapshot::all_disabled(),
        Instant::now(),
    );
    assert!(matches!(refused, Err(PipelineError::PipelineFull)));
}

#[test]
fn test_worker_panic_does_not_stall_the_queue() {
    let transform = Arc::new(PanicOnSeq {
        seq: 2,
        processed: AtomicUsize::new(0),
    });
    let mut scheduler = FrameScheduler::new(Arc::clone(&transform), 2, true);

    let (released, _) = drive(&mut scheduler, 4);

    // seq2は失敗として数えられ、残りは順序どおり解放される
    assert_eq!(released, vec![1, 3, 4]);
    assert_eq!(transform.processed.load(Ordering::SeqCst), 4);
}
