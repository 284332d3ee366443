mod common;
mod correlation_pipeline_test;
mod query_pipeline_test;
