use std::time::Duration;

use netconsole::{Command, TelnetConsole};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const WAIT: Duration = Duration::from_secs(5);

async fn read_until(stream: &mut TcpStream, needle: &str) -> String {
    let mut seen = String::new();
    let mut buf = [0u8; 1024];
    tokio::time::timeout(WAIT, async {
        while !seen.contains(needle) {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream closed before {needle:?}, got {seen:?}");
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}, got {seen:?}"));
    seen
}

async fn wait_for_clients(telnet: &TelnetConsole, expected: usize) {
    tokio::time::timeout(WAIT, async {
        while telnet.client_count().await != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("client count never reached {expected}"));
}

async fn connect(telnet: &TelnetConsole) -> TcpStream {
    TcpStream::connect(telnet.local_addr()).await.unwrap()
}

#[tokio::test]
async fn test_commands_round_trip() {
    let telnet = TelnetConsole::bind("127.0.0.1:0", 2).await.unwrap();
    telnet.add_command(Command::new("echo", "repeat", |console, _cmd, args| async move {
        console.print(args.join("-")).await;
        Ok(())
    }));

    let mut client = connect(&telnet).await;
    read_until(&mut client, "> ").await;

    client.write_all(b"echo a b c\r\n").await.unwrap();
    read_until(&mut client, "a-b-c\r\n").await;

    client.write_all(b"help\r\n").await.unwrap();
    let help = read_until(&mut client, "# repeat #").await;
    assert!(help.contains("######   LIST OF CONSOLE'S CMD  #######"));
    assert!(help.contains("+ whoAmI"));

    client.write_all(b"nothing\r\n").await.unwrap();
    read_until(&mut client, "Command Not Found!").await;

    telnet.shutdown().await;
    telnet.join().await.unwrap();
}

#[tokio::test]
async fn test_login_before_commands() {
    let telnet = TelnetConsole::bind("127.0.0.1:0", 2).await.unwrap();
    telnet.set_on_new_console(|console| console.enable_login("s3cret"));

    let mut client = connect(&telnet).await;
    read_until(&mut client, "Password?").await;

    client.write_all(b"wrong\r\n").await.unwrap();
    read_until(&mut client, "Password?").await;

    client.write_all(b"s3cret\r\n").await.unwrap();
    read_until(&mut client, "Authenticated\r\n> ").await;

    client.write_all(b"whoAmI\r\n").await.unwrap();
    read_until(&mut client, "User Level = Root").await;

    telnet.shutdown().await;
}

#[tokio::test]
async fn test_capacity_rejects_extra_client() {
    let telnet = TelnetConsole::bind("127.0.0.1:0", 1).await.unwrap();

    let mut first = connect(&telnet).await;
    read_until(&mut first, "> ").await;
    wait_for_clients(&telnet, 1).await;

    let mut second = connect(&telnet).await;
    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(WAIT, second.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0, "rejected client must be closed without output");
    assert_eq!(telnet.client_count().await, 1);

    // The surviving session is unaffected.
    first.write_all(b"whoAmI\r\n").await.unwrap();
    read_until(&mut first, "User Level").await;

    telnet.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_frees_slot() {
    let telnet = TelnetConsole::bind("127.0.0.1:0", 1).await.unwrap();

    let mut first = connect(&telnet).await;
    read_until(&mut first, "> ").await;
    wait_for_clients(&telnet, 1).await;
    drop(first);
    wait_for_clients(&telnet, 0).await;

    let mut again = connect(&telnet).await;
    read_until(&mut again, "> ").await;
    wait_for_clients(&telnet, 1).await;

    telnet.shutdown().await;
}

#[tokio::test]
async fn test_idle_timeout_closes_client() {
    let telnet = TelnetConsole::bind("127.0.0.1:0", 1).await.unwrap();
    telnet.set_timeout(Duration::from_millis(100));
    telnet.set_on_new_console(|console| console.set_watchdog_interval(Duration::from_millis(20)));

    let mut client = connect(&telnet).await;
    read_until(&mut client, "Timeout Expired").await;
    wait_for_clients(&telnet, 0).await;
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    let telnet = TelnetConsole::bind("127.0.0.1:0", 2).await.unwrap();
    let mut client = connect(&telnet).await;
    read_until(&mut client, "> ").await;
    wait_for_clients(&telnet, 1).await;

    telnet.shutdown().await;
    telnet.join().await.unwrap();

    let mut buf = [0u8; 64];
    let closed = tokio::time::timeout(WAIT, async {
        loop {
            match client.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    assert!(TcpStream::connect(telnet.local_addr()).await.is_err());
}
