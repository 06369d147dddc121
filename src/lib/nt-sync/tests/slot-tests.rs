mod sync;

mod slot_tests {
    use nt_sync::{SlotChannel, WriterClosed};

    use super::*;

    #[test]
    fn test_send_then_receive() {
        sync::model(|| {
            let channel = SlotChannel::new();
            channel.send(7u32);
            assert_eq!(channel.receive(), Ok(7));
        })
    }

    #[test]
    fn test_receiver_blocks_until_send() {
        sync::model(|| {
            let channel = sync::Arc::new(SlotChannel::<u32>::new());
            let reader = {
                let channel = channel.clone();
                sync::thread::spawn(move || channel.receive())
            };
            channel.send(11);
            assert_eq!(reader.join().unwrap(), Ok(11));
        })
    }

    #[test]
    fn test_close_wakes_blocked_receiver() {
        sync::model(|| {
            let channel = sync::Arc::new(SlotChannel::<u32>::new());
            let reader = {
                let channel = channel.clone();
                sync::thread::spawn(move || channel.receive())
            };
            channel.close_writer();
            assert_eq!(reader.join().unwrap(), Err(WriterClosed));
            assert!(channel.is_writer_closed());
        })
    }

    #[test]
    fn test_pending_message_survives_close() {
        sync::model(|| {
            let channel = SlotChannel::<u32>::new();
            channel.send(3);
            channel.close_writer();
            assert_eq!(channel.receive(), Ok(3));
            assert_eq!(channel.receive(), Err(WriterClosed));
        })
    }

    #[test]
    fn test_close_races_with_send() {
        sync::model(|| {
            let channel = sync::Arc::new(SlotChannel::<u32>::new());
            let writer = {
                let channel = channel.clone();
                sync::thread::spawn(move || channel.send(5))
            };
            let closer = {
                let channel = channel.clone();
                sync::thread::spawn(move || channel.close_writer())
            };
            let res = channel.receive();
            assert!(res == Ok(5) || res == Err(WriterClosed));
            writer.join().unwrap();
            closer.join().unwrap();
        })
    }

    #[test]
    fn test_request_reply_pair() {
        // Same shape as a session connection: one channel each way, strictly
        // alternating.
        sync::model(|| {
            let requests = sync::Arc::new(SlotChannel::<u32>::new());
            let replies = sync::Arc::new(SlotChannel::<u32>::new());
            let server = {
                let requests = requests.clone();
                let replies = replies.clone();
                sync::thread::spawn(move || {
                    let mut served = 0;
                    while let Ok(req) = requests.receive() {
                        replies.send(req * 10);
                        served += 1;
                    }
                    served
                })
            };
            for i in 1..=3 {
                requests.send(i);
                assert_eq!(replies.receive(), Ok(i * 10));
            }
            requests.close_writer();
            assert_eq!(server.join().unwrap(), 3);
        })
    }

    #[cfg(not(loom))]
    #[test]
    fn test_many_round_trips_with_jitter() {
        let requests = std::sync::Arc::new(SlotChannel::<u64>::new());
        let replies = std::sync::Arc::new(SlotChannel::<u64>::new());
        let server = {
            let requests = requests.clone();
            let replies = replies.clone();
            std::thread::spawn(move || {
                while let Ok(req) = requests.receive() {
                    if rand::random::<u8>() < 8 {
                        std::thread::yield_now();
                    }
                    replies.send(req + 1);
                }
            })
        };
        for i in 0..2000u64 {
            requests.send(i);
            assert_eq!(replies.receive(), Ok(i + 1));
        }
        requests.close_writer();
        server.join().unwrap();
    }
}
