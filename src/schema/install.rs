use indoc::indoc;

/// Base schema, executed as one batch when the job table is absent.
///
/// `{prefix}` is substituted textually before execution. The two indexes
/// shipped as migrations (`Set.Score`, `JobQueue.FetchToken`) are deliberately
/// not part of this script.
pub(crate) const INSTALL_STATEMENTS: &[&str] = &[
    indoc! {r#"
        CREATE TABLE IF NOT EXISTS `{prefix}Job` (
            `Id` BIGINT NOT NULL AUTO_INCREMENT,
            `StateId` BIGINT NULL,
            `StateName` VARCHAR(20) NULL,
            `InvocationData` LONGTEXT NOT NULL,
            `Arguments` LONGTEXT NOT NULL,
            `CreatedAt` DATETIME(6) NOT NULL,
            `ExpireAt` DATETIME(6) NULL,
            PRIMARY KEY (`Id`),
            KEY `IX_{prefix}Job_StateName` (`StateName`),
            KEY `IX_{prefix}Job_ExpireAt` (`ExpireAt`)
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4;
    "#},
    indoc! {r#"
        CREATE TABLE IF NOT EXISTS `{prefix}JobParameter` (
            `Id` BIGINT NOT NULL AUTO_INCREMENT,
            `JobId` BIGINT NOT NULL,
            `Name` VARCHAR(40) NOT NULL,
            `Value` LONGTEXT NULL,
            PRIMARY KEY (`Id`),
            UNIQUE KEY `UX_{prefix}JobParameter_JobId_Name` (`JobId`, `Name`),
            CONSTRAINT `FK_{prefix}JobParameter_Job` FOREIGN KEY (`JobId`)
                REFERENCES `{prefix}Job` (`Id`) ON DELETE CASCADE
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4;
    "#},
    indoc! {r#"
        CREATE TABLE IF NOT EXISTS `{prefix}JobQueue` (
            `Id` BIGINT NOT NULL AUTO_INCREMENT,
            `JobId` BIGINT NOT NULL,
            `Queue` VARCHAR(50) NOT NULL,
            `FetchedAt` DATETIME(6) NULL,
            `FetchToken` VARCHAR(36) NULL,
            PRIMARY KEY (`Id`),
            KEY `IX_{prefix}JobQueue_Queue_FetchedAt` (`Queue`, `FetchedAt`)
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4;
    "#},
    indoc! {r#"
        CREATE TABLE IF NOT EXISTS `{prefix}State` (
            `Id` BIGINT NOT NULL AUTO_INCREMENT,
            `JobId` BIGINT NOT NULL,
            `Name` VARCHAR(20) NOT NULL,
            `Reason` VARCHAR(100) NULL,
            `CreatedAt` DATETIME(6) NOT NULL,
            `Data` LONGTEXT NULL,
            PRIMARY KEY (`Id`),
            KEY `IX_{prefix}State_JobId` (`JobId`),
            CONSTRAINT `FK_{prefix}State_Job` FOREIGN KEY (`JobId`)
                REFERENCES `{prefix}Job` (`Id`) ON DELETE CASCADE
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4;
    "#},
    indoc! {r#"
        CREATE TABLE IF NOT EXISTS `{prefix}Server` (
            `Id` VARCHAR(100) NOT NULL,
            `Data` LONGTEXT NULL,
            `LastHeartbeat` DATETIME(6) NOT NULL,
            PRIMARY KEY (`Id`)
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4;
    "#},
    indoc! {r#"
        CREATE TABLE IF NOT EXISTS `{prefix}Hash` (
            `Id` BIGINT NOT NULL AUTO_INCREMENT,
            `Key` VARCHAR(100) NOT NULL,
            `Field` VARCHAR(40) NOT NULL,
            `Value` LONGTEXT NULL,
            `ExpireAt` DATETIME(6) NULL,
            PRIMARY KEY (`Id`),
            UNIQUE KEY `UX_{prefix}Hash_Key_Field` (`Key`, `Field`),
            KEY `IX_{prefix}Hash_ExpireAt` (`ExpireAt`)
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4;
    "#},
    indoc! {r#"
        CREATE TABLE IF NOT EXISTS `{prefix}Set` (
            `Id` BIGINT NOT NULL AUTO_INCREMENT,
            `Key` VARCHAR(100) NOT NULL,
            `Value` VARCHAR(256) NOT NULL,
            `Score` DOUBLE NOT NULL,
            `ExpireAt` DATETIME(6) NULL,
            PRIMARY KEY (`Id`),
            UNIQUE KEY `UX_{prefix}Set_Key_Value` (`Key`, `Value`),
            KEY `IX_{prefix}Set_ExpireAt` (`ExpireAt`)
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4;
    "#},
    indoc! {r#"
        CREATE TABLE IF NOT EXISTS `{prefix}List` (
            `Id` BIGINT NOT NULL AUTO_INCREMENT,
            `Key` VARCHAR(100) NOT NULL,
            `Value` LONGTEXT NULL,
            `ExpireAt` DATETIME(6) NULL,
            PRIMARY KEY (`Id`),
            KEY `IX_{prefix}List_Key` (`Key`),
            KEY `IX_{prefix}List_ExpireAt` (`ExpireAt`)
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4;
    "#},
    indoc! {r#"
        CREATE TABLE IF NOT EXISTS `{prefix}Counter` (
            `Id` BIGINT NOT NULL AUTO_INCREMENT,
            `Key` VARCHAR(100) NOT NULL,
            `Value` INT NOT NULL,
            `ExpireAt` DATETIME(6) NULL,
            PRIMARY KEY (`Id`),
            KEY `IX_{prefix}Counter_Key` (`Key`),
            KEY `IX_{prefix}Counter_ExpireAt` (`ExpireAt`)
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4;
    "#},
    indoc! {r#"
        CREATE TABLE IF NOT EXISTS `{prefix}AggregatedCounter` (
            `Id` BIGINT NOT NULL AUTO_INCREMENT,
            `Key` VARCHAR(100) NOT NULL,
            `Value` INT NOT NULL,
            `ExpireAt` DATETIME(6) NULL,
            PRIMARY KEY (`Id`),
            UNIQUE KEY `UX_{prefix}AggregatedCounter_Key` (`Key`),
            KEY `IX_{prefix}AggregatedCounter_ExpireAt` (`ExpireAt`)
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4;
    "#},
];
