/// コア型定義
///
/// Domain層の中心となるデータ構造。
/// フレーム・キーポイント・マッチはすべて生成後に変更されない値型として扱う。

/// キャプチャされたフレームデータ
///
/// 3チャンネルBGR、行優先の連続メモリ。`seq` はキャプチャ時に採番される
/// 単調増加のシーケンス番号で、スケジューラの順序保証の基準になる。
#[derive(Debug, Clone)]
pub struct Frame {
    /// キャプチャ順のシーケンス番号（1始まり）
    pub seq: u64,
    /// 画像の幅
    pub width: u32,
    /// 画像の高さ
    pub height: u32,
    /// フレーム画像データ（BGR形式、width * height * 3 バイト）
    pub data: Vec<u8>,
}

impl Frame {
    /// 新しいフレームを作成
    pub fn new(seq: u64, width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            seq,
            width,
            height,
            data,
        }
    }

    /// 単色のフレームを作成（テスト・合成画像用）
    pub fn filled(seq: u64, width: u32, height: u32, bgr: [u8; 3]) -> Self {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for _ in 0..(width * height) {
            data.extend_from_slice(&bgr);
        }
        Self::new(seq, width, height, data)
    }

    /// データ長が width * height * 3 と一致しているか
    pub fn is_well_formed(&self) -> bool {
        self.data.len() == (self.width as usize) * (self.height as usize) * 3
    }
}

/// 検出されたキーポイント
///
/// 位置・応答強度・近傍サイズのみを持つ。生成後は不変。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    /// X座標（サブピクセル精度）
    pub x: f32,
    /// Y座標（サブピクセル精度）
    pub y: f32,
    /// 近傍ウィンドウの直径（ピクセル）
    pub size: f32,
    /// コーナー応答強度
    pub response: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, size: f32, response: f32) -> Self {
        Self {
            x,
            y,
            size,
            response,
        }
    }

    /// フレーム境界から margin ピクセル以上内側にあるか
    pub fn is_inside(&self, width: u32, height: u32, margin: f32) -> bool {
        self.x >= margin
            && self.y >= margin
            && self.x <= width as f32 - margin
            && self.y <= height as f32 - margin
    }
}

/// キーポイントに1:1で付随する固定長記述子
///
/// コーナー抑制エンジンでは平均差し引き済みの近傍ウィンドウを平坦化したもの。
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor(pub Vec<f32>);

impl Descriptor {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// 2フレーム間のキーポイント対応
///
/// 1回のマッチング呼び出しの間だけ有効な値。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPair {
    /// フレームA側のキーポイントindex
    pub query_idx: usize,
    /// フレームB側のキーポイントindex
    pub train_idx: usize,
    /// 記述子間距離（Hamming）
    pub distance: f32,
}

/// 特徴マッチングの結果（左右連結の合成画像 + マッチ数）
#[derive(Debug, Clone)]
pub struct MatchView {
    /// マッチ線を描画した左右連結画像
    pub image: Frame,
    /// 採用されたマッチ数
    pub match_count: usize,
}

/// 変換チェーン1回分の出力
///
/// `prev` は差分ステージが更新した「次の前フレーム」。呼び出し側（Runner）が
/// 解放順に受け取り、次のsubmitに使う。
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    /// 変換後の出力フレーム
    pub output: Frame,
    /// 更新された前フレーム（差分計算前の現フレームのコピー）
    pub prev: Frame,
    /// 特徴マッチングステージが有効だった場合の合成画像
    pub match_view: Option<MatchView>,
}
