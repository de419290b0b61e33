use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use aes::Aes128;
use aes::cipher::{BlockDecrypt, KeyInit, generic_array::GenericArray};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::fan::DeviceError;

/// Port on which devices announce themselves with plaintext JSON (protocol 3.1).
pub const PLAINTEXT_PORT: u16 = 6666;
/// Port on which devices announce themselves with AES-encrypted JSON (protocol 3.3+).
pub const ENCRYPTED_PORT: u16 = 6667;

/// Well-known secret every Tuya device derives its broadcast key from.
const UDP_KEY_SEED: &[u8] = b"yGAdlopoPVldABfn";
const FRAME_PREFIX: [u8; 4] = [0x00, 0x00, 0x55, 0xaa];
/// prefix, sequence, command, length
const HEADER_LEN: usize = 16;
/// CRC and suffix
const TRAILER_LEN: usize = 8;

/// One process-wide listener for device broadcasts. Every fan waiting for its
/// address shares the same sockets; sightings are fanned out by `gwId`.
pub struct Discovery {
    seen: watch::Sender<HashMap<String, IpAddr>>,
}

#[derive(Debug, PartialEq)]
struct Sighting {
    gw_id: String,
    ip: Option<IpAddr>,
}

impl Discovery {
    pub fn new() -> Arc<Self> {
        let (seen, _) = watch::channel(HashMap::new());
        Arc::new(Self { seen })
    }

    /// Bind both broadcast ports and record every device that announces itself.
    pub fn listen(self: &Arc<Self>) {
        for port in [PLAINTEXT_PORT, ENCRYPTED_PORT] {
            tokio::spawn(self.clone().listen_on(port));
        }
    }

    /// Wait until the device with `id` has been seen and return its address.
    pub async fn find(&self, id: &str, timeout: Duration) -> Result<IpAddr, DeviceError> {
        let mut seen = self.seen.subscribe();
        tokio::time::timeout(timeout, seen.wait_for(|devices| devices.contains_key(id)))
            .await
            .map_err(|_| DeviceError::Timeout("device broadcast"))?
            .map_err(|_| DeviceError::Discovery("broadcast listener stopped".into()))?
            .get(id)
            .copied()
            .ok_or_else(|| DeviceError::Discovery(format!("{id} vanished from sightings")))
    }

    fn record(&self, gw_id: String, ip: IpAddr) {
        self.seen.send_if_modified(|devices| {
            if devices.get(&gw_id) == Some(&ip) {
                return false;
            }
            info!("Device {} announced itself at {}", gw_id, ip);
            devices.insert(gw_id, ip);
            true
        });
    }

    async fn listen_on(self: Arc<Self>, port: u16) {
        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(socket) => socket,
            Err(e) => {
                error!("Cannot listen for device broadcasts on UDP {}: {}", port, e);
                return;
            }
        };

        let mut buf = vec![0u8; 4096];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("Broadcast receive on UDP {} failed: {}", port, e);
                    continue;
                }
            };

            match parse_broadcast(&buf[..len]) {
                Some(sighting) => self.record(sighting.gw_id, sighting.ip.unwrap_or(from.ip())),
                None => debug!("Ignoring unreadable broadcast from {}", from),
            }
        }
    }
}

/// Decode one broadcast packet, plaintext or encrypted.
fn parse_broadcast(packet: &[u8]) -> Option<Sighting> {
    let body: serde_json::Value = json_body(packet)
        .and_then(|plain| serde_json::from_slice(plain).ok())
        .or_else(|| serde_json::from_slice(&decrypt_frame(packet)?).ok())?;

    Some(Sighting {
        gw_id: body.get("gwId")?.as_str()?.to_string(),
        ip: body
            .get("ip")
            .and_then(|ip| ip.as_str())
            .and_then(|ip| ip.parse().ok()),
    })
}

/// The JSON object inside a plaintext frame, if there is one.
fn json_body(packet: &[u8]) -> Option<&[u8]> {
    let start = packet.iter().position(|b| *b == b'{')?;
    let end = packet.iter().rposition(|b| *b == b'}')?;
    (start < end).then(|| &packet[start..=end])
}

fn udp_cipher() -> Aes128 {
    Aes128::new(&GenericArray::from(md5::compute(UDP_KEY_SEED).0))
}

/// Decrypt the payload of an encrypted `55AA` frame (AES-128-ECB, PKCS#7).
fn decrypt_frame(packet: &[u8]) -> Option<Vec<u8>> {
    if packet.len() < HEADER_LEN + TRAILER_LEN || packet[..4] != FRAME_PREFIX {
        return None;
    }
    let mut data = packet[HEADER_LEN..packet.len() - TRAILER_LEN].to_vec();
    // Some firmwares put a 4-byte return code ahead of the ciphertext.
    if data.len() % 16 == 4 {
        data.drain(..4);
    }
    if data.is_empty() || data.len() % 16 != 0 {
        return None;
    }

    let cipher = udp_cipher();
    for block in data.chunks_exact_mut(16) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }

    let pad = usize::from(*data.last()?);
    if pad == 0 || pad > 16 || pad > data.len() {
        return None;
    }
    data.truncate(data.len() - pad);
    Some(data)
}

#[cfg(test)]
mod tests {
    use aes::cipher::BlockEncrypt;

    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut packet = FRAME_PREFIX.to_vec();
        packet.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0x13]);
        packet.extend_from_slice(&((payload.len() + TRAILER_LEN) as u32).to_be_bytes());
        packet.extend_from_slice(payload);
        packet.extend_from_slice(&[0x12, 0x34, 0x56, 0x78, 0x00, 0x00, 0xaa, 0x55]);
        packet
    }

    fn encrypted_frame(body: &str) -> Vec<u8> {
        let mut data = body.as_bytes().to_vec();
        let pad = 16 - data.len() % 16;
        data.extend(std::iter::repeat_n(pad as u8, pad));
        let cipher = udp_cipher();
        for block in data.chunks_exact_mut(16) {
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        frame(&data)
    }

    #[test]
    fn reads_plaintext_broadcast() {
        let packet = frame(br#"{"ip":"192.168.1.40","gwId":"bf123","active":2,"version":"3.1"}"#);
        assert_eq!(
            parse_broadcast(&packet),
            Some(Sighting {
                gw_id: "bf123".to_string(),
                ip: Some("192.168.1.40".parse().unwrap()),
            })
        );
    }

    #[test]
    fn reads_encrypted_broadcast() {
        let packet = encrypted_frame(r#"{"ip":"192.168.1.41","gwId":"bf456","version":"3.3"}"#);
        assert_eq!(
            parse_broadcast(&packet),
            Some(Sighting {
                gw_id: "bf456".to_string(),
                ip: Some("192.168.1.41".parse().unwrap()),
            })
        );
    }

    #[test]
    fn encrypted_broadcast_with_return_code_is_read() {
        let mut packet = encrypted_frame(r#"{"gwId":"bf789"}"#);
        packet.splice(HEADER_LEN..HEADER_LEN, [0, 0, 0, 0]);
        assert_eq!(
            parse_broadcast(&packet).map(|s| s.gw_id),
            Some("bf789".to_string())
        );
    }

    #[test]
    fn ignores_garbage() {
        assert_eq!(parse_broadcast(b"\x00\x00\x55\xaa garbage"), None);
        assert_eq!(parse_broadcast(&frame(&[7u8; 32])), None);
        assert_eq!(parse_broadcast(&frame(br#"{"ip":"192.168.1.40"}"#)), None);
    }

    #[tokio::test]
    async fn several_devices_share_one_listener() {
        let discovery = Discovery::new();
        let a = discovery.clone();
        let b = discovery.clone();
        let fan_a = tokio::spawn(async move { a.find("fan_a", Duration::from_secs(5)).await });
        let fan_b = tokio::spawn(async move { b.find("fan_b", Duration::from_secs(5)).await });
        tokio::task::yield_now().await;

        discovery.record("fan_b".to_string(), "192.168.1.51".parse().unwrap());
        discovery.record("other".to_string(), "192.168.1.99".parse().unwrap());
        discovery.record("fan_a".to_string(), "192.168.1.50".parse().unwrap());

        assert_eq!(fan_a.await.unwrap().unwrap(), "192.168.1.50".parse::<IpAddr>().unwrap());
        assert_eq!(fan_b.await.unwrap().unwrap(), "192.168.1.51".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn device_seen_before_the_lookup_is_found_at_once() {
        let discovery = Discovery::new();
        discovery.record("fan_a".to_string(), "192.168.1.50".parse().unwrap());

        let ip = discovery.find("fan_a", Duration::from_millis(1)).await.unwrap();
        assert_eq!(ip, "192.168.1.50".parse::<IpAddr>().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_times_out() {
        let discovery = Discovery::new();
        let result = discovery.find("fan_a", Duration::from_secs(10)).await;
        assert!(matches!(result, Err(DeviceError::Timeout(_))));
    }
}
