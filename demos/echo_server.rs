//! Minimal echo server exercising the public `netmgr` surface: binds a
//! plaintext TCP listener behind a small quota, and echoes back whatever
//! each connection sends until it disconnects.

use std::net::SocketAddr;
use std::sync::Arc;

use netmgr::{NetmgrConfig, NetworkManager, Quota, RecvResult};

fn main() -> std::io::Result<()> {
    env_logger::init();

    let config = NetmgrConfig { workers: 2, ..NetmgrConfig::default() };
    let manager = NetworkManager::new(config)?;
    let quota = Arc::new(Quota::new(64, 48));

    let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
    let handle = manager
        .listen_tcp(
            addr,
            Box::new(|conn, result| {
                if result.is_err() {
                    return;
                }
                conn.read(Box::new(|conn, result| match result {
                    RecvResult::Success(data) => {
                        conn.send_data(data.to_vec(), None);
                    }
                    RecvResult::Eof | RecvResult::Error(_) => {
                        conn.shutdown();
                    }
                }));
            }),
            128,
            Some(quota),
        )
        .expect("bind 127.0.0.1:8080");

    println!("echoing on {addr}, press Ctrl+C to stop");
    std::thread::sleep(std::time::Duration::from_secs(3600));

    manager.stop_listening(&handle).ok();
    manager.closedown();
    manager.destroy();
    Ok(())
}
