/// Retries a fallible expression a bounded number of times, sleeping for
/// `interval` between attempts.
///
/// ```ignore
/// let connection = retry!(dial(addr).await, 5, Duration::from_secs(1))?;
/// ```
#[macro_export]
macro_rules! retry {
    ($f:expr, $count:expr, $interval:expr) => {{
        let mut retries = 1;
        let result = loop {
            let result = $f;
            if result.is_ok() {
                break result;
            } else if retries > $count {
                log::error!("Failed; giving up after {} attempts", $count);
                break result;
            } else {
                log::error!(
                    "Failed: {}",
                    result.err().expect("Should always be an error")
                );
                log::warn!("Attempt {} out of {}", retries, $count);
                retries += 1;
                tokio::time::sleep($interval).await;
            }
        };
        result
    }};
    ($f:expr) => {
        $crate::retry!($f, 5, std::time::Duration::from_secs(1))
    };
}
