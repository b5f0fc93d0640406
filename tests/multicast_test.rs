mod common;

use std::time::Duration;

use common::{is_quit, setup, wait_event};
use framenet::{
    AppError, EngineState, MulticastSender, NetClient, NetConfig, NetMessage, NetSystem,
    Sinks,
};
use rstest::rstest;

const GROUP: &str = "239.255.77.77";

#[rstest]
#[ignore = "needs a multicast capable interface"]
fn test_group_delivery(_setup: ()) -> Result<(), AppError> {
    let mut config = NetConfig::multicast(GROUP, 47_777);
    config.multicast.interface = "127.0.0.1".to_string();
    config.multicast.loopback = true;

    let (sinks, rx) = Sinks::channel(64);
    let receiver = NetClient::new(NetSystem::init(), config.clone(), sinks);
    let node = receiver.start()?;
    assert_eq!(node.peer_addr().to_string(), format!("{}:47777", GROUP));
    assert!(matches!(receiver.send(b"nope"), Err(AppError::Unsupported(_))));
    assert!(matches!(receiver.hello(), Err(AppError::Unsupported(_))));

    let sender = MulticastSender::new(&config)?;
    let mut delivered = None;
    for _ in 0..20 {
        sender.send(b"to the group")?;
        if let Some(NetMessage::Data(_, data)) =
            common::wait_for(&rx, Duration::from_millis(100), |m| {
                matches!(m, NetMessage::Data(..))
            })
        {
            delivered = Some(data);
            break;
        }
    }
    assert_eq!(delivered.as_deref(), Some(&b"to the group"[..]));

    sender.release();
    assert!(matches!(sender.send(b"late"), Err(AppError::NodeClosed(_))));

    receiver.stop()?;
    assert!(wait_event(&rx, is_quit).is_some());
    assert_eq!(receiver.state(), EngineState::Stopped);
    Ok(())
}
