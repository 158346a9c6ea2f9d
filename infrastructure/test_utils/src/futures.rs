// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

/// Periodically check if a value becomes the expected value within a maximum number of attempts.
/// Uses `tokio::time::sleep` between attempts, so it must run in an async context.
///
/// ```nocompile
/// async_assert_eventually!(
///    check_counter(),
///    expect = 124,
///    max_attempts = 10,
///    interval = Duration::from_millis(500)
/// );
/// ```
#[macro_export]
macro_rules! async_assert_eventually {
    ($check_expr:expr, expect = $expect:expr, max_attempts = $max_attempts:expr, interval = $interval:expr $(,)?) => {{
        let mut value = $check_expr;
        let mut attempts = 0;
        while value != $expect {
            attempts += 1;
            if attempts > $max_attempts {
                panic!(
                    "async_assert_eventually assertion failed. Expression did not equal value after {} attempts.",
                    $max_attempts
                );
            }
            tokio::time::sleep($interval).await;
            value = $check_expr;
        }
    }};

    ($check_expr:expr, expect = $expect:expr $(,)?) => {{
        $crate::async_assert_eventually!(
            $check_expr,
            expect = $expect,
            max_attempts = 10,
            interval = std::time::Duration::from_millis(100)
        );
    }};
}

/// Assert that an expression eventually becomes true within a maximum number of attempts.
#[macro_export]
macro_rules! async_assert {
    ($check_expr:expr, max_attempts = $max_attempts:expr, interval = $interval:expr $(,)?) => {{
        let mut attempts = 0;
        while !($check_expr) {
            attempts += 1;
            if attempts > $max_attempts {
                panic!("async_assert assertion failed after {} attempts", $max_attempts);
            }
            tokio::time::sleep($interval).await;
        }
    }};
}
