//! Mock HQPlayer native-protocol server: newline-delimited XML over TCP.
//!
//! Serves the discovery handshake (`GetInfo` + option lists) and records
//! every `Set*` command so tests can assert the value→index translation.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub struct MockHqpServer {
    addr: SocketAddr,
    commands: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl MockHqpServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let commands: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let commands_for_server = commands.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let commands = commands_for_server.clone();
                tokio::spawn(async move {
                    let (read_half, mut write_half) = socket.into_split();
                    let mut reader = BufReader::new(read_half);
                    let mut line = String::new();
                    loop {
                        line.clear();
                        match reader.read_line(&mut line).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {}
                        }
                        let request = line.trim().to_string();
                        commands.lock().unwrap().push(request.clone());
                        let response = respond(&request);
                        if write_half
                            .write_all(format!("{}\n", response).as_bytes())
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });
            }
        });

        Self { addr, commands, handle }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Raw request lines received so far.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

fn respond(request: &str) -> String {
    if request.contains("<GetInfo") {
        r#"<GetInfo name="Mock HQP" product="HQPlayer Embedded" version="5.1.0" platform="linux"/>"#
            .to_string()
    } else if request.contains("<GetModes") {
        concat!(
            "<GetModes>",
            r#"<ModesItem index="0" name="PCM" value="-1"/>"#,
            r#"<ModesItem index="1" name="SDM" value="0"/>"#,
            r#"<ModesItem index="2" name="Auto" value="1"/>"#,
            "</GetModes>"
        )
        .to_string()
    } else if request.contains("<GetFilters") {
        concat!(
            "<GetFilters>",
            r#"<FiltersItem index="0" name="sinc-L" value="0"/>"#,
            r#"<FiltersItem index="1" name="poly-sinc-ext2" value="1"/>"#,
            "</GetFilters>"
        )
        .to_string()
    } else if request.contains("<GetShapers") {
        concat!(
            "<GetShapers>",
            r#"<ShapersItem index="0" name="LNS15" value="0"/>"#,
            r#"<ShapersItem index="1" name="ASDM7EC" value="1"/>"#,
            "</GetShapers>"
        )
        .to_string()
    } else if request.contains("<GetRates") {
        concat!(
            "<GetRates>",
            r#"<RatesItem index="0" rate="0"/>"#,
            r#"<RatesItem index="1" rate="44100"/>"#,
            r#"<RatesItem index="2" rate="48000"/>"#,
            "</GetRates>"
        )
        .to_string()
    } else if request.contains("<State") {
        r#"<State state="2" mode="0" filter1x="1" filterNx="1" filter="1" shaper="0" rate="0" volume="-20" active_mode="-1" active_rate="44100" invert="0" convolution="0"/>"#
            .to_string()
    } else if request.contains("<Status") {
        r#"<Status state="2" track="1" position="42" length="300" volume="-20" active_mode="PCM" active_filter="poly-sinc-ext2" active_shaper="LNS15" active_rate="44100"/>"#
            .to_string()
    } else if request.contains("<VolumeRange") {
        r#"<VolumeRange min="-60" max="0" step="1" enabled="1" adaptive="0"/>"#.to_string()
    } else if request.contains("<MatrixListProfiles") {
        concat!(
            "<MatrixListProfiles>",
            r#"<MatrixProfile index="0" name="Flat"/>"#,
            r#"<MatrixProfile index="1" name="Room EQ"/>"#,
            "</MatrixListProfiles>"
        )
        .to_string()
    } else if request.contains("<MatrixGetProfile") {
        r#"<MatrixGetProfile index="0" value="Flat"/>"#.to_string()
    } else {
        // Set*/transport commands just get an OK-shaped echo.
        r#"<ack result="OK"/>"#.to_string()
    }
}
