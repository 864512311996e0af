use indoc::formatdoc;

use crate::model::{
    listener::SaslMechanism, security::KafkaSecurity, ClusterMember, KAFKA_ENV_FILE,
    SERVER_PROPERTIES_FILE,
};

/// Returns the script starting the Kafka process of one member.
///
/// The storage directories are formatted on first start only (`--ignore-formatted`), together
/// with the SCRAM credentials of the internal users.
pub fn kafka_start_script(
    kafka_home: &str,
    config_dir: &str,
    cluster_id: &str,
    controllers: &[&ClusterMember],
    scram_users: &[(&str, &str)],
) -> String {
    formatdoc! {"
        #!/usr/bin/env bash
        set -euo pipefail

        set -a
        source {config_dir}/{KAFKA_ENV_FILE}
        set +a

        cd {kafka_home}
        bin/kafka-storage.sh format --cluster-id {cluster_id} --config {config_dir}/{SERVER_PROPERTIES_FILE} --initial-controllers {initial_controllers} --ignore-formatted{scram}
        exec bin/kafka-server-start.sh {config_dir}/{SERVER_PROPERTIES_FILE}
        ",
        initial_controllers = to_initial_controllers(controllers),
        scram = to_add_scram_args(scram_users),
    }
}

pub fn to_initial_controllers(controllers: &[&ClusterMember]) -> String {
    controllers
        .iter()
        .map(|member| member.as_initial_controller(KafkaSecurity::CONTROLLER_PORT))
        .collect::<Vec<String>>()
        .join(",")
}

pub fn to_bootstrap_servers(controllers: &[&ClusterMember]) -> String {
    controllers
        .iter()
        .map(|member| member.as_bootstrap_server(KafkaSecurity::CONTROLLER_PORT))
        .collect::<Vec<String>>()
        .join(",")
}

fn to_add_scram_args(scram_users: &[(&str, &str)]) -> String {
    scram_users
        .iter()
        .map(|(user, password)| {
            format!(
                " --add-scram '{mechanism}=[name={user},password={password}]'",
                mechanism = SaslMechanism::ScramSha512
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{role::ProcessRoles, MemberAddress, MemberId};

    fn controller(id: u32) -> ClusterMember {
        ClusterMember::new(
            MemberId(id),
            MemberAddress {
                host: format!("controller-{id}"),
                port: 9092,
            },
            ProcessRoles::Controller,
        )
    }

    #[test]
    fn test_start_script() {
        let controllers = [controller(0), controller(1)];
        let controllers: Vec<&ClusterMember> = controllers.iter().collect();

        let script = kafka_start_script(
            "/opt/kafka",
            "/etc/kafka",
            "abc",
            &controllers,
            &[("sync", "pw1"), ("admin", "pw2")],
        );

        assert!(script.starts_with("#!/usr/bin/env bash\n"));
        assert!(script.contains(
            "bin/kafka-storage.sh format --cluster-id abc --config /etc/kafka/server.properties \
             --initial-controllers 0@controller-0:9097:0000000000-00000000000,1@controller-1:9097:0000000000-00000000001 \
             --ignore-formatted --add-scram 'SCRAM-SHA-512=[name=sync,password=pw1]' \
             --add-scram 'SCRAM-SHA-512=[name=admin,password=pw2]'\n"
        ));
        assert!(script.contains("exec bin/kafka-server-start.sh /etc/kafka/server.properties\n"));
        assert_eq!(
            to_bootstrap_servers(&controllers),
            "controller-0:9097,controller-1:9097"
        );
    }
}
