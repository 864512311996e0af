use crate::operator_config::BrokerSettings;

const JAVA_HEAP_FACTOR: f32 = 0.8;

/// All JVM arguments.
fn construct_jvm_args(settings: &BrokerSettings) -> Vec<String> {
    let mut jvm_args = vec![];

    if let Some(memory_limit) = settings.memory_limit_mib {
        let java_heap = (memory_limit as f32 * JAVA_HEAP_FACTOR).floor() as u32;
        // Heap settings
        jvm_args.push(format!("-Xmx{java_heap}m"));
        jvm_args.push(format!("-Xms{java_heap}m"));
    }
    jvm_args.push("-XX:+ExitOnOutOfMemoryError".to_string());
    jvm_args.extend(settings.jvm_arguments.iter().cloned());

    jvm_args
}

/// Arguments that go into `KAFKA_OPTS`, so *not* the heap settings (which you can get using
/// [`construct_heap_jvm_args`]).
pub fn construct_non_heap_jvm_args(settings: &BrokerSettings) -> String {
    let mut jvm_args = construct_jvm_args(settings);
    jvm_args.retain(|arg| !is_heap_jvm_argument(arg));

    jvm_args.join(" ")
}

/// Arguments that go into `KAFKA_HEAP_OPTS`.
/// You can get the normal JVM arguments using [`construct_non_heap_jvm_args`].
pub fn construct_heap_jvm_args(settings: &BrokerSettings) -> String {
    let mut jvm_args = construct_jvm_args(settings);
    jvm_args.retain(|arg| is_heap_jvm_argument(arg));

    jvm_args.join(" ")
}

fn is_heap_jvm_argument(jvm_argument: &str) -> bool {
    let lowercase = jvm_argument.to_lowercase();

    lowercase.starts_with("-xms") || lowercase.starts_with("-xmx")
}
