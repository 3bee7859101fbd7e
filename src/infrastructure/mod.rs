//! Infrastructure層: 外部技術との接続
//!
//! OpenCVによるキャプチャ・画像処理・表示の具象実装。
//! Domain層のポートを実装し、Application層から注入される。

pub mod capture;
pub mod convert;
pub mod display;
pub mod features;
pub mod harris;
pub mod transform;

pub use capture::OpenCvCapture;
pub use display::HighguiDisplay;
pub use features::FeatureMatchEngine;
pub use harris::HarrisCornerEngine;
pub use transform::TransformChain;
