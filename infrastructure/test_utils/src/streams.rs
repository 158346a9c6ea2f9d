// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

/// Collect `take` items from a stream, or panic after `timeout`.
///
/// Requires the `tokio` runtime and must be used in an async context.
#[macro_export]
macro_rules! collect_stream {
    ($stream:expr, take=$take:expr, timeout=$timeout:expr $(,)?) => {{
        use tokio::time;

        // Evaluate $stream once, NOT in the loop 🐛🚨
        let stream = &mut $stream;

        let mut items = Vec::new();
        loop {
            if let Some(item) = time::timeout($timeout, futures::stream::StreamExt::next(stream))
                .await
                .unwrap_or_else(|_| {
                    panic!(
                        "Timeout before stream could collect {} item(s). Got {} item(s).",
                        $take,
                        items.len()
                    )
                })
            {
                items.push(item);
                if items.len() == $take {
                    break items;
                }
            } else {
                break items;
            }
        }
    }};
}

/// Collect items from a channel receiver until it would block, or until `take` items arrive.
#[macro_export]
macro_rules! collect_recv {
    ($rx:expr, take=$take:expr, timeout=$timeout:expr $(,)?) => {{
        use tokio::time;

        let mut items = Vec::new();
        while items.len() < $take {
            match time::timeout($timeout, $rx.recv()).await {
                Ok(Some(item)) => items.push(item),
                Ok(None) => break,
                Err(_) => panic!(
                    "Timeout before receiver could collect {} item(s). Got {} item(s).",
                    $take,
                    items.len()
                ),
            }
        }
        items
    }};
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use futures::stream;

    #[tokio::test]
    async fn collect_stream() {
        let mut stream = stream::iter(1..10);
        assert_eq!(
            collect_stream!(stream, take = 3, timeout = Duration::from_secs(1)),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn collect_recv() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(10);
        for i in 0..5 {
            tx.send(i).await.unwrap();
        }
        drop(tx);
        let items = collect_recv!(rx, take = 5, timeout = Duration::from_secs(1));
        assert_eq!(items, vec![0, 1, 2, 3, 4]);
    }
}
