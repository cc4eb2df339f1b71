use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::utils::{GatewayError, GatewayResult};

/// 下发给客户端的一帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn json<T: Serialize>(value: &T) -> GatewayResult<Self> {
        serde_json::to_string(value)
            .map(Frame::Text)
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }
}

/// 任务结果的下发编码，只影响边界格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultEncoding {
    Text,
    Binary,
}

impl ResultEncoding {
    pub fn encode(self, bytes: Vec<u8>) -> GatewayResult<Frame> {
        match self {
            ResultEncoding::Binary => Ok(Frame::Binary(bytes)),
            ResultEncoding::Text => String::from_utf8(bytes)
                .map(Frame::Text)
                .map_err(|_| GatewayError::Upstream("task result is not valid UTF-8".to_string())),
        }
    }
}

#[async_trait]
pub trait StatusSink: Send {
    async fn send(&mut self, frame: Frame) -> GatewayResult<()>;
}

#[async_trait]
impl StatusSink for mpsc::Sender<Frame> {
    async fn send(&mut self, frame: Frame) -> GatewayResult<()> {
        mpsc::Sender::send(self, frame)
            .await
            .map_err(|_| GatewayError::Disconnected)
    }
}

#[async_trait]
impl StatusSink for Vec<Frame> {
    async fn send(&mut self, frame: Frame) -> GatewayResult<()> {
        self.push(frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_encoding_rejects_invalid_utf8() {
        assert_eq!(
            ResultEncoding::Text.encode(b"ok".to_vec()).unwrap(),
            Frame::Text("ok".into())
        );
        assert!(ResultEncoding::Text.encode(vec![0xff, 0xfe]).is_err());
        assert_eq!(
            ResultEncoding::Binary.encode(vec![0xff]).unwrap(),
            Frame::Binary(vec![0xff])
        );
    }

    #[tokio::test]
    async fn channel_sink_reports_disconnect() {
        let (mut tx, rx) = mpsc::channel::<Frame>(1);
        drop(rx);
        let err = StatusSink::send(&mut tx, Frame::Text("x".into())).await.unwrap_err();
        assert!(matches!(err, GatewayError::Disconnected));
    }
}
