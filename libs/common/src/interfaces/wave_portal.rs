use alloy_sol_types::sol;

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface IWavePortal {
        struct Wave {
            address waver;
            string message;
            uint256 timestamp;
        }

        event NewWave(address indexed from, uint256 timestamp, string message);

        function wave(string memory _message) external;

        function getAllWaves() external view returns (Wave[] memory);

        function getTotalWaves() external view returns (uint256);
    }
}
