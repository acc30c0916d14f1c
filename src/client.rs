use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_types::region::Region;
use aws_types::SdkConfig;

/// Loads the shared SDK configuration. An explicit region wins over the
/// default provider chain (environment, profile, instance metadata).
pub async fn load_sdk_config(region: Option<&str>) -> SdkConfig {
    let region_provider =
        RegionProviderChain::first_try(region.map(|provided| Region::new(provided.to_string())))
            .or_default_provider();

    let sdk_config = aws_config::defaults(BehaviorVersion::latest())
        .region(region_provider)
        .load()
        .await;

    tracing::debug!(region = ?sdk_config.region(), "Loaded AWS configuration");

    return sdk_config;
}
