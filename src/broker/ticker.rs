//! Kite WebSocket tick stream.
//!
//! Control messages (subscribe, mode) are JSON text frames; quote updates
//! arrive as binary frames packing one or more fixed-layout tick packets.
//! Decoded ticks are forwarded on an mpsc channel so the consumer task owns
//! all state mutation.

use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::traits::{BrokerError, BrokerResult};
use super::types::Tick;

const WS_URL: &str = "wss://ws.kite.trade";

/// Quote subscription depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickMode {
    /// Last traded price only (8-byte packets).
    Ltp,
    /// LTP plus OHLC and volume (44-byte packets).
    Quote,
    /// Everything including open interest and market depth (184 bytes).
    Full,
}

impl TickMode {
    fn as_str(&self) -> &'static str {
        match self {
            TickMode::Ltp => "ltp",
            TickMode::Quote => "quote",
            TickMode::Full => "full",
        }
    }
}

/// Events emitted by the tick stream.
#[derive(Debug, Clone)]
pub enum TickerEvent {
    Connected,
    Ticks(Vec<Tick>),
    Disconnected,
}

/// Kite streaming client.
pub struct KiteTicker {
    api_key: String,
    access_token: String,
    ws_url: String,
}

impl KiteTicker {
    pub fn new(api_key: &str, access_token: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            access_token: access_token.to_string(),
            ws_url: WS_URL.to_string(),
        }
    }

    /// Connect, subscribe the given tokens and forward decoded events until
    /// the connection closes or the receiver is dropped.
    pub async fn stream(
        &self,
        tokens: Vec<u32>,
        mode: TickMode,
        tx: mpsc::Sender<TickerEvent>,
    ) -> BrokerResult<()> {
        let url = format!(
            "{}?api_key={}&access_token={}",
            self.ws_url, self.api_key, self.access_token
        );

        info!(tokens = tokens.len(), mode = mode.as_str(), "connecting tick stream");

        let (ws_stream, _) = connect_async(&url)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let subscribe = json!({ "a": "subscribe", "v": &tokens });
        let set_mode = json!({ "a": "mode", "v": (mode.as_str(), &tokens) });
        for msg in [subscribe, set_mode] {
            write
                .send(Message::Text(msg.to_string().into()))
                .await
                .map_err(|e| BrokerError::Transport(e.to_string()))?;
        }

        let _ = tx.send(TickerEvent::Connected).await;

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Binary(buf)) => {
                        let ticks = parse_tick_frame(&buf);
                        if !ticks.is_empty() && tx.send(TickerEvent::Ticks(ticks)).await.is_err() {
                            warn!("tick receiver dropped, stopping stream");
                            return;
                        }
                    }
                    Ok(Message::Text(text)) => {
                        // Postbacks and error notices arrive as JSON text.
                        debug!(%text, "ticker text message");
                    }
                    Ok(Message::Ping(_)) => {
                        // Pong handled by tungstenite.
                    }
                    Ok(Message::Close(_)) => {
                        info!("tick stream closed by server");
                        let _ = tx.send(TickerEvent::Disconnected).await;
                        return;
                    }
                    Err(e) => {
                        error!(error = %e, "tick stream error");
                        let _ = tx.send(TickerEvent::Disconnected).await;
                        return;
                    }
                    _ => {}
                }
            }
        });

        Ok(())
    }
}

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    buf.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    buf.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
}

/// Prices on the wire are integers in paise for equity/derivative segments.
fn price_from_raw(raw: u32) -> Decimal {
    Decimal::new(raw as i64, 2)
}

/// Decode one binary frame into tick structs.
///
/// Layout: 2-byte packet count, then for each packet a 2-byte length followed
/// by the payload. Payloads are 8 (ltp), 44 (quote) or 184 (full) bytes.
pub(crate) fn parse_tick_frame(buf: &[u8]) -> Vec<Tick> {
    let Some(count) = read_u16(buf, 0) else {
        return Vec::new();
    };

    let mut ticks = Vec::with_capacity(count as usize);
    let mut offset = 2usize;

    for _ in 0..count {
        let Some(len) = read_u16(buf, offset) else { break };
        offset += 2;
        let Some(packet) = buf.get(offset..offset + len as usize) else {
            break;
        };
        offset += len as usize;

        let Some(token) = read_u32(packet, 0) else { continue };
        let Some(ltp_raw) = read_u32(packet, 4) else { continue };

        let mut tick = Tick {
            instrument_token: token,
            last_price: price_from_raw(ltp_raw),
            open_interest: None,
            volume_traded: None,
            bid: None,
            ask: None,
        };

        if packet.len() >= 44 {
            tick.volume_traded = read_u32(packet, 16).map(u64::from);
        }

        if packet.len() >= 184 {
            tick.open_interest = read_u32(packet, 48).map(u64::from);
            // Depth starts at byte 64: ten 12-byte entries, buy side first.
            // Entry layout: quantity(4), price(4), orders(2), padding(2).
            tick.bid = read_u32(packet, 64 + 4).map(price_from_raw);
            tick.ask = read_u32(packet, 124 + 4).map(price_from_raw);
        }

        ticks.push(tick);
    }

    ticks
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ltp_packet(token: u32, price_paise: u32) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&token.to_be_bytes());
        p.extend_from_slice(&price_paise.to_be_bytes());
        p
    }

    fn frame(packets: &[Vec<u8>]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(packets.len() as u16).to_be_bytes());
        for p in packets {
            buf.extend_from_slice(&(p.len() as u16).to_be_bytes());
            buf.extend_from_slice(p);
        }
        buf
    }

    #[test]
    fn test_parse_ltp_frame() {
        let buf = frame(&[ltp_packet(408065, 145_050)]);
        let ticks = parse_tick_frame(&buf);
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].instrument_token, 408065);
        assert_eq!(ticks[0].last_price, dec!(1450.50));
        assert!(ticks[0].bid.is_none());
    }

    #[test]
    fn test_parse_multi_packet_frame() {
        let buf = frame(&[ltp_packet(1, 100), ltp_packet(2, 200)]);
        let ticks = parse_tick_frame(&buf);
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[1].instrument_token, 2);
        assert_eq!(ticks[1].last_price, dec!(2.00));
    }

    #[test]
    fn test_parse_full_packet_depth() {
        let mut packet = vec![0u8; 184];
        packet[0..4].copy_from_slice(&42u32.to_be_bytes());
        packet[4..8].copy_from_slice(&10_000u32.to_be_bytes()); // ltp 100.00
        packet[16..20].copy_from_slice(&5_000u32.to_be_bytes()); // volume
        packet[48..52].copy_from_slice(&777u32.to_be_bytes()); // open interest
        packet[68..72].copy_from_slice(&9_990u32.to_be_bytes()); // best bid
        packet[128..132].copy_from_slice(&10_010u32.to_be_bytes()); // best ask

        let buf = frame(&[packet]);
        let ticks = parse_tick_frame(&buf);
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].last_price, dec!(100.00));
        assert_eq!(ticks[0].volume_traded, Some(5_000));
        assert_eq!(ticks[0].open_interest, Some(777));
        assert_eq!(ticks[0].bid, Some(dec!(99.90)));
        assert_eq!(ticks[0].ask, Some(dec!(100.10)));
    }

    #[test]
    fn test_truncated_frame_is_dropped() {
        let buf = vec![0u8, 2, 0, 8, 0, 0]; // claims 2 packets, payload cut short
        assert!(parse_tick_frame(&buf).is_empty());
    }
}
