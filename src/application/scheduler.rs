//! 順序保証付き非同期フレームスケジューラ
//!
//! キャプチャ順に受け付けたフレームをワーカープールへ分配し、完了順に
//! かかわらず「提出順」で結果を解放する。pendingのFIFOはプールサイズを
//! 上限とし、満杯の間は新しいフレームを受け付けない。
//!
//! # 順序保証の仕組み
//! 結果の解放はFIFO先頭のready判定のみで進む。後から提出されたタスクが
//! 先に完了しても、先頭が完了するまで解放されない。ロックによるフレーム
//! 単位の同期は行わない。

use crate::domain::{
    config::TransformSnapshot,
    error::{PipelineError, PipelineResult},
    ports::TransformPort,
    types::{Frame, ProcessedFrame},
};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// ワーカーに渡す処理単位
type Job = Box<dyn FnOnce() + Send + 'static>;

/// 完了したタスクの成果
#[derive(Debug)]
pub struct TaskOutcome {
    /// 変換結果。ステージ失敗時は `Err(Stage)`
    pub result: PipelineResult<ProcessedFrame>,
    /// submit時刻（レイテンシ計測用）
    pub submitted_at: Instant,
}

impl TaskOutcome {
    fn worker_lost(submitted_at: Instant) -> Self {
        Self {
            result: Err(PipelineError::Stage(
                "worker terminated before producing a result".to_string(),
            )),
            submitted_at,
        }
    }
}

/// 提出済みフレームのハンドル
///
/// in-flight → ready の一方向にのみ遷移する。readyになったタスクが
/// 再キューイングされることはない。
pub enum PendingTask {
    /// ワーカープールで処理中。結果は専用のbounded(1)チャネルで届く
    Pooled {
        rx: Receiver<TaskOutcome>,
        submitted_at: Instant,
        done: Option<TaskOutcome>,
    },
    /// 逐次モードで既に実行済み（常にready）
    Immediate(TaskOutcome),
}

impl PendingTask {
    /// readyかどうか（Pooledは結果の到着を非ブロッキングで確認する）
    ///
    /// ワーカーがパニックして送信側がdropされた場合もreadyと見なし、
    /// エラー成果に差し替える。FIFOの先頭が失敗タスクで停滞することはない。
    pub fn is_ready(&mut self) -> bool {
        match self {
            Self::Immediate(_) => true,
            Self::Pooled {
                rx,
                submitted_at,
                done,
            } => {
                if done.is_some() {
                    return true;
                }
                match rx.try_recv() {
                    Ok(outcome) => {
                        *done = Some(outcome);
                        true
                    }
                    Err(TryRecvError::Empty) => false,
                    Err(TryRecvError::Disconnected) => {
                        *done = Some(TaskOutcome::worker_lost(*submitted_at));
                        true
                    }
                }
            }
        }
    }

    /// 成果を取り出す（ready後に呼ばれる前提）
    pub fn take(self) -> TaskOutcome {
        match self {
            Self::Immediate(outcome) => outcome,
            Self::Pooled {
                rx,
                submitted_at,
                done,
            } => match done {
                Some(outcome) => outcome,
                None => rx
                    .recv()
                    .unwrap_or_else(|_| TaskOutcome::worker_lost(submitted_at)),
            },
        }
    }
}

/// 固定サイズのワーカープール
///
/// ジョブは単一のチャネルを全ワーカーで共有して取り合う。Drop時は
/// チャネルを閉じ、実行中のジョブの完了のみ待つ（キュー残は破棄）。
struct WorkerPool {
    job_tx: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn new(size: usize) -> Self {
        let (job_tx, job_rx) = unbounded::<Job>();

        let handles = (0..size)
            .map(|i| {
                let rx: Receiver<Job> = job_rx.clone();
                std::thread::Builder::new()
                    .name(format!("frame-worker-{}", i))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            // ジョブ内のパニックはワーカーを殺さない。
                            // 結果チャネルの送信側がdropされ、該当タスクは
                            // エラー成果として解放される。
                            let _ = catch_unwind(AssertUnwindSafe(job));
                        }
                    })
                    .unwrap_or_else(|e| panic!("failed to spawn worker thread: {}", e))
            })
            .collect();

        Self {
            job_tx: Some(job_tx),
            handles,
        }
    }

    fn execute(&self, job: Job) {
        if let Some(tx) = &self.job_tx {
            // 受信側が全滅している場合のみ失敗する（シャットダウン中）
            let _ = tx.send(job);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // チャネルを閉じてワーカーのループを終わらせる
        self.job_tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// 順序保証付き非同期フレームスケジューラ
pub struct FrameScheduler<P: TransformPort + 'static> {
    transform: Arc<P>,
    pool: WorkerPool,
    pool_size: usize,
    pending: VecDeque<PendingTask>,
    parallel: bool,
}

impl<P: TransformPort + 'static> FrameScheduler<P> {
    /// 新しいスケジューラを作成
    ///
    /// # Arguments
    /// - `transform`: 変換チェーン実装（ワーカー間で共有）
    /// - `pool_size`: ワーカー数 = pendingのFIFO上限
    /// - `parallel`: 初期モード
    pub fn new(transform: Arc<P>, pool_size: usize, parallel: bool) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            transform,
            pool: WorkerPool::new(pool_size),
            pool_size,
            pending: VecDeque::with_capacity(pool_size),
            parallel,
        }
    }

    /// 新しいフレームを受け付けられるか
    pub fn has_capacity(&self) -> bool {
        self.pending.len() < self.pool_size
    }

    /// 未解放のタスク数
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// 並列モードか
    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// モードを切り替える
    ///
    /// 切り替え後に提出されたタスクにのみ適用される。処理中のタスクは
    /// 影響を受けない。
    pub fn set_parallel(&mut self, parallel: bool) {
        self.parallel = parallel;
    }

    /// フレームを1枚提出する
    ///
    /// # Returns
    /// - `Err(PipelineFull)`: pendingが上限に達している（呼び出し側は
    ///   先に `next_ready()` で解放してから再試行する）
    pub fn submit(
        &mut self,
        frame: Frame,
        prev: Frame,
        snapshot: TransformSnapshot,
        submitted_at: Instant,
    ) -> PipelineResult<()> {
        if !self.has_capacity() {
            return Err(PipelineError::PipelineFull);
        }

        if self.parallel {
            let (tx, rx) = bounded::<TaskOutcome>(1);
            let transform = Arc::clone(&self.transform);
            self.pool.execute(Box::new(move || {
                let result = transform.process(&frame, &prev, &snapshot);
                let _ = tx.send(TaskOutcome {
                    result,
                    submitted_at,
                });
            }));
            self.pending.push_back(PendingTask::Pooled {
                rx,
                submitted_at,
                done: None,
            });
        } else {
            let result = self.transform.process(&frame, &prev, &snapshot);
            self.pending.push_back(PendingTask::Immediate(TaskOutcome {
                result,
                submitted_at,
            }));
        }

        Ok(())
    }

    /// 先頭がreadyなら1件解放する
    ///
    /// 提出順を厳密に守る。先頭が未完了なら `None` を返し、後続タスクが
    /// 完了していても解放しない。ブロックは一切しない。
    pub fn next_ready(&mut self) -> Option<TaskOutcome> {
        let head_ready = self
            .pending
            .front_mut()
            .map(PendingTask::is_ready)
            .unwrap_or(false);

        if !head_ready {
            return None;
        }

        self.pending.pop_front().map(PendingTask::take)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::MatchView;
    use std::sync::Mutex;
    use std::time::Duration;

    /// フレームseqごとに指定された遅延を入れるモック変換
    struct DelayTransform {
        delays_ms: Vec<u64>,
    }

    impl TransformPort for DelayTransform {
        fn process(
            &self,
            frame: &Frame,
            prev: &Frame,
            _snapshot: &TransformSnapshot,
        ) -> PipelineResult<ProcessedFrame> {
            let idx = (frame.seq as usize).saturating_sub(1);
            if let Some(&delay) = self.delays_ms.get(idx) {
                std::thread::sleep(Duration::from_millis(delay));
            }
            Ok(ProcessedFrame {
                output: frame.clone(),
                prev: prev.clone(),
                match_view: None,
            })
        }
    }

    /// スナップショットのsigma_indexを出力フレームのseqに写すモック
    struct SnapshotEcho;

    impl TransformPort for SnapshotEcho {
        fn process(
            &self,
            frame: &Frame,
            prev: &Frame,
            snapshot: &TransformSnapshot,
        ) -> PipelineResult<ProcessedFrame> {
            let mut output = frame.clone();
            output.seq = snapshot.sigma_index as u64;
            Ok(ProcessedFrame {
                output,
                prev: prev.clone(),
                match_view: None,
            })
        }
    }

    /// 指定seqでパニックするモック
    struct PanickingTransform {
        panic_on_seq: u64,
    }

    impl TransformPort for PanickingTransform {
        fn process(
            &self,
            frame: &Frame,
            prev: &Frame,
            _snapshot: &TransformSnapshot,
        ) -> PipelineResult<ProcessedFrame> {
            if frame.seq == self.panic_on_seq {
                panic!("intentional test panic");
            }
            Ok(ProcessedFrame {
                output: frame.clone(),
                prev: prev.clone(),
                match_view: None,
            })
        }
    }

    /// 呼び出しモードを記録するモック（呼び出しスレッド名で判別）
    struct ThreadRecorder {
        on_worker: Mutex<Vec<bool>>,
    }

    impl TransformPort for ThreadRecorder {
        fn process(
            &self,
            frame: &Frame,
            prev: &Frame,
            _snapshot: &TransformSnapshot,
        ) -> PipelineResult<ProcessedFrame> {
            let on_worker = std::thread::current()
                .name()
                .map(|n| n.starts_with("frame-worker-"))
                .unwrap_or(false);
            self.on_worker
                .lock()
                .expect("recorder lock")
                .push(on_worker);
            Ok(ProcessedFrame {
                output: frame.clone(),
                prev: prev.clone(),
                match_view: None,
            })
        }
    }

    fn frame(seq: u64) -> Frame {
        Frame::filled(seq, 4, 4, [0, 0, 0])
    }

    /// キャプチャループと同じ形で全フレームを流し、解放順と最大in-flightを返す
    fn drive<P: TransformPort + 'static>(
        scheduler: &mut FrameScheduler<P>,
        total: u64,
    ) -> (Vec<u64>, usize) {
        let mut released = Vec::new();
        let mut max_in_flight = 0;
        let mut next_seq = 1u64;

        while released.len() < total as usize {
            while let Some(outcome) = scheduler.next_ready() {
                match outcome.result {
                    Ok(processed) => released.push(processed.output.seq),
                    Err(PipelineError::Stage(_)) => released.push(0), // 失敗フレームは0で記録
                    Err(e) => panic!("unexpected error: {:?}", e),
                }
            }

            if next_seq <= total && scheduler.has_capacity() {
                scheduler
                    .submit(
                        frame(next_seq),
                        frame(next_seq),
                        TransformSnapshot::all_disabled(),
                        Instant::now(),
                    )
                    .expect("submit within capacity");
                next_seq += 1;
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }

            max_in_flight = max_in_flight.max(scheduler.in_flight());
        }

        (released, max_in_flight)
    }

    #[test]
    fn test_fifo_order_with_randomized_delays() {
        // 仕様シナリオ: プール4、遅延 [50,10,40,5,30,20,25,15] ms でも
        // 解放順は提出順 1..8 のまま
        let transform = Arc::new(DelayTransform {
            delays_ms: vec![50, 10, 40, 5, 30, 20, 25, 15],
        });
        let mut scheduler = FrameScheduler::new(transform, 4, true);

        let (released, max_in_flight) = drive(&mut scheduler, 8);

        assert_eq!(released, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(
            max_in_flight <= 4,
            "in-flight exceeded pool size: {}",
            max_in_flight
        );
    }

    #[test]
    fn test_sequential_mode_releases_in_order() {
        let transform = Arc::new(DelayTransform {
            delays_ms: vec![5; 6],
        });
        let mut scheduler = FrameScheduler::new(transform, 4, false);

        let (released, _) = drive(&mut scheduler, 6);
        assert_eq!(released, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_submit_refused_when_full() {
        // 完了しない程度に遅いタスクでFIFOを満たす
        let transform = Arc::new(DelayTransform {
            delays_ms: vec![200; 3],
        });
        let mut scheduler = FrameScheduler::new(transform, 2, true);

        scheduler
            .submit(
                frame(1),
                frame(1),
                TransformSnapshot::all_disabled(),
                Instant::now(),
            )
            .expect("first submit");
        scheduler
            .submit(
                frame(2),
                frame(2),
                TransformSnapshot::all_disabled(),
                Instant::now(),
            )
            .expect("second submit");

        assert!(!scheduler.has_capacity());
        let result = scheduler.submit(
            frame(3),
            frame(3),
            TransformSnapshot::all_disabled(),
            Instant::now(),
        );
        assert!(matches!(result, Err(PipelineError::PipelineFull)));
    }

    #[test]
    fn test_head_blocks_release_of_later_tasks() {
        // 先頭が遅く、2番目が即完了するケース
        let transform = Arc::new(DelayTransform {
            delays_ms: vec![100, 0],
        });
        let mut scheduler = FrameScheduler::new(transform, 2, true);

        scheduler
            .submit(
                frame(1),
                frame(1),
                TransformSnapshot::all_disabled(),
                Instant::now(),
            )
            .expect("submit 1");
        scheduler
            .submit(
                frame(2),
                frame(2),
                TransformSnapshot::all_disabled(),
                Instant::now(),
            )
            .expect("submit 2");

        // 2番目が完了するまで待っても、先頭未完了なら何も解放されない
        std::thread::sleep(Duration::from_millis(30));
        assert!(scheduler.next_ready().is_none());
        assert_eq!(scheduler.in_flight(), 2);

        // 先頭完了後は両方が順に解放される
        std::thread::sleep(Duration::from_millis(100));
        let first = scheduler.next_ready().expect("head ready");
        assert_eq!(first.result.expect("head ok").output.seq, 1);
        let second = scheduler.next_ready().expect("second ready");
        assert_eq!(second.result.expect("second ok").output.seq, 2);
    }

    #[test]
    fn test_worker_panic_surfaces_error_and_does_not_stall() {
        let transform = Arc::new(PanickingTransform { panic_on_seq: 2 });
        let mut scheduler = FrameScheduler::new(transform, 4, true);

        let (released, _) = drive(&mut scheduler, 4);

        // seq2は失敗（0で記録）、前後のフレームは順序どおり
        assert_eq!(released, vec![1, 0, 3, 4]);
    }

    #[test]
    fn test_mode_switch_affects_only_later_submissions() {
        let transform = Arc::new(ThreadRecorder {
            on_worker: Mutex::new(Vec::new()),
        });
        let mut scheduler = FrameScheduler::new(Arc::clone(&transform), 2, true);

        scheduler
            .submit(
                frame(1),
                frame(1),
                TransformSnapshot::all_disabled(),
                Instant::now(),
            )
            .expect("parallel submit");

        scheduler.set_parallel(false);
        scheduler
            .submit(
                frame(2),
                frame(2),
                TransformSnapshot::all_disabled(),
                Instant::now(),
            )
            .expect("sequential submit");

        // 両方解放されるまで回す
        let mut released = 0;
        while released < 2 {
            if scheduler.next_ready().is_some() {
                released += 1;
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        let calls = transform.on_worker.lock().expect("recorder lock");
        assert_eq!(calls.len(), 2);
        // 逐次モードの2枚目はワーカースレッド以外（呼び出し元）で実行される
        assert!(!calls[1]);
    }

    #[test]
    fn test_snapshot_travels_with_task() {
        let transform = Arc::new(SnapshotEcho);
        let mut scheduler = FrameScheduler::new(transform, 2, true);

        let mut snapshot = TransformSnapshot::all_disabled();
        snapshot.sigma_index = 7;
        scheduler
            .submit(frame(1), frame(1), snapshot, Instant::now())
            .expect("submit");

        let outcome = loop {
            if let Some(outcome) = scheduler.next_ready() {
                break outcome;
            }
            std::thread::sleep(Duration::from_millis(1));
        };

        // 提出時に採ったスナップショットの値が処理に使われている
        assert_eq!(outcome.result.expect("ok").output.seq, 7);
    }

    #[test]
    fn test_match_view_passthrough() {
        struct WithMatchView;
        impl TransformPort for WithMatchView {
            fn process(
                &self,
                frame: &Frame,
                prev: &Frame,
                _snapshot: &TransformSnapshot,
            ) -> PipelineResult<ProcessedFrame> {
                Ok(ProcessedFrame {
                    output: frame.clone(),
                    prev: prev.clone(),
                    match_view: Some(MatchView {
                        image: frame.clone(),
                        match_count: 3,
                    }),
                })
            }
        }

        let mut scheduler = FrameScheduler::new(Arc::new(WithMatchView), 1, false);
        scheduler
            .submit(
                frame(1),
                frame(1),
                TransformSnapshot::all_disabled(),
                Instant::now(),
            )
            .expect("submit");

        let outcome = scheduler.next_ready().expect("immediate task is ready");
        let processed = outcome.result.expect("ok");
        assert_eq!(
            processed.match_view.expect("match view").match_count,
            3
        );
    }
}
